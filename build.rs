use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories that hold build output or third-party reference code, never project sources.
const SKIPPED_DIRS: [&str; 2] = ["./target", "./examples"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// The kinds of source-policy violation this script rejects.
#[derive(Clone, Copy)]
enum Rule {
    UnderscoreBinding,
    ForbiddenWord,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => r"\b(_[a-zA-Z0-9_]+)\b",
            Rule::ForbiddenWord => {
                r"(//|/\*|///).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)"
            }
            Rule::StarsInComment => r"(//|/\*).*\*\*",
            Rule::UppercaseComment => r"(//|/\*|///).*",
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    // The underscore rule also polices this script; the comment rules would trip on
    // their own pattern strings.
    fn applies_to_build_script(self) -> bool {
        matches!(self, Rule::UnderscoreBinding)
    }

    fn summary(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => "underscore-prefixed bindings",
            Rule::ForbiddenWord => "forbidden comment words",
            Rule::StarsInComment => "'**' in regular comments",
            Rule::UppercaseComment => "comments with only uppercase letters",
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn guidance(self) -> String {
        match self {
            Rule::UnderscoreBinding => {
                "Underscore-prefixed names are not allowed in this project.\n   \
                 Either use the binding under its plain name or remove it."
                    .to_string()
            }
            Rule::ForbiddenWord => format!(
                "Comments may not contain any of: {}.\n   \
                 Describe what the code does instead of how it got there.",
                FORBIDDEN_WORDS.join(", ")
            ),
            Rule::StarsInComment => {
                "'**' is only allowed in doc comments.".to_string()
            }
            Rule::UppercaseComment => {
                "Comments where every letter is uppercase are not allowed.\n   \
                 Strongly consider deleting the comment."
                    .to_string()
            }
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] is not allowed; use the code or delete it.".to_string()
            }
        }
    }

    // Decides whether one matched line is a real violation.
    fn is_violation(self, line: &str) -> bool {
        match self {
            Rule::UnderscoreBinding => !is_comment_line(line) && !underscore_inside_string(line),
            Rule::ForbiddenWord | Rule::AllowDeadCode => true,
            Rule::StarsInComment => {
                !is_doc_comment(line) || FORBIDDEN_WORDS.iter().any(|word| line.contains(word))
            }
            Rule::UppercaseComment => comment_text(line).is_some_and(|text| {
                let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }),
        }
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with("//")
        || (line.contains("/*") && !line.contains("*/match") && !line.contains("*/let"))
}

// Odd-numbered segments between double quotes are string contents.
fn underscore_inside_string(line: &str) -> bool {
    line.contains('"')
        && line
            .split('"')
            .enumerate()
            .any(|(index, part)| index % 2 == 1 && part.contains('_'))
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        Some(rest.trim())
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        Some(rest.trim())
    } else if let Some(index) = line.find("/*") {
        let body = &line[index + 2..];
        Some(match body.find("*/") {
            Some(end) => body[..end].trim(),
            None => body.trim(),
        })
    } else {
        None
    }
}

// Collects every violating line of one file.
struct RuleCollector {
    rule: Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl RuleCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn report(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut message = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.summary(),
            self.file_path.to_str().unwrap_or("?")
        );
        for violation in &self.violations {
            message.push_str(&format!("   {violation}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", self.rule.guidance()));
        Some(message)
    }
}

impl Sink for RuleCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn rust_sources() -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(".")
        .into_iter()
        .filter_entry(|entry| !SKIPPED_DIRS.iter().any(|dir| entry.path().starts_with(dir)))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"))
}

fn enforce(rule: Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern())?;
    let mut searcher = Searcher::new();

    for entry in rust_sources() {
        if entry.file_name() == "build.rs" && !rule.applies_to_build_script() {
            continue;
        }
        let path = entry.path();
        if std::fs::read_to_string(path).is_err() {
            continue;
        }

        let mut collector = RuleCollector::new(rule, path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(message) = collector.report() {
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    check_build_script_lints();

    let rules = [
        Rule::UnderscoreBinding,
        Rule::ForbiddenWord,
        Rule::StarsInComment,
        Rule::UppercaseComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = enforce(rule) {
            // `eprintln!` is what surfaces the message in cargo's output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

// Compiles this script on its own with the project's strict lints.
fn check_build_script_lints() {
    let output = std::process::Command::new("rustc")
        .args([
            "--edition",
            "2021",
            "-D",
            "unused_variables",
            "-D",
            "dead_code",
            "-D",
            "unused_imports",
            "--crate-type",
            "bin",
            "--error-format",
            "human",
            "--emit",
            "metadata",
            "-o",
            "-",
            "build.rs",
        ])
        .output();

    let output = match output {
        Ok(output) => output,
        Err(_) => {
            eprintln!("cargo:warning=Could not check build.rs for unused code");
            return;
        }
    };
    if output.status.success() {
        return;
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let findings = [
        ("unused variable", "Unused variables"),
        ("is never used", "Unused functions"),
        ("unused import", "Unused imports"),
    ];
    for (needle, label) in findings {
        if stderr.contains(needle) {
            eprintln!("\n❌ ERROR: {label} detected in build.rs!");
            eprintln!("{stderr}");
            eprintln!("\n⚠️ {label} are not allowed in this project.");
            std::process::exit(1);
        }
    }
}
