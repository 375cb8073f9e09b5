use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories that never hold crate sources: build output and the read-only
// reference pack that lives next to the manifest.
const SKIPPED_ROOTS: [&str; 2] = ["./target", "./examples"];

// Every rule below produces its findings through this collector. The rule decides
// which matched lines count as violations; the collector only records them.
struct RuleCollector<'r> {
    rule: &'r Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

// A single source policy enforced at build time.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    guidance: &'static str,
    applies_to_build_script: bool,
    accept: fn(&str) -> bool,
}

impl<'r> RuleCollector<'r> {
    fn new(rule: &'r Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.name,
            file_name
        );
        for violation in &self.violations {
            msg.push_str(&format!("   {violation}\n"));
        }
        msg.push_str(&format!("\n⚠️ {}\n", self.rule.guidance));
        Some(msg)
    }
}

impl Sink for RuleCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.accept)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///") || line.trim_start().starts_with("//!")
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

// Underscore-prefixed bindings outside comments and string literals.
fn underscore_binding(line: &str) -> bool {
    if line.trim_start().starts_with("//") {
        return false;
    }
    if line.contains('"') {
        let inside_quotes = line
            .split('"')
            .enumerate()
            .any(|(i, part)| i % 2 == 1 && part.contains('_'));
        if inside_quotes {
            return false;
        }
    }
    true
}

fn forbidden_word(line: &str) -> bool {
    is_comment(line)
}

// Double stars are allowed for emphasis in doc comments only.
fn stars_outside_docs(line: &str) -> bool {
    !is_doc_comment(line)
}

fn all_uppercase_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    let text = if let Some(rest) = trimmed.strip_prefix("///") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("//!") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        rest
    } else if let Some(idx) = line.find("/*") {
        let tail = &line[idx + 2..];
        match tail.find("*/") {
            Some(end) => &tail[..end],
            None => tail,
        }
    } else {
        return false;
    };
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
}

fn always(line: &str) -> bool {
    !line.is_empty()
}

const RULES: [Rule; 5] = [
    Rule {
        name: "underscore-prefixed variables",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        guidance: "Underscore-prefixed variable names are not allowed in this project. Use the value or remove it.",
        applies_to_build_script: true,
        accept: underscore_binding,
    },
    Rule {
        name: "forbidden comment words",
        pattern: r"(//|/\*).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)",
        guidance: "Comments narrating edits are forbidden. Describe what the code does instead.",
        applies_to_build_script: false,
        accept: forbidden_word,
    },
    Rule {
        name: "'**' patterns in regular comments",
        pattern: r"(//|/\*).*\*\*",
        guidance: "The '**' pattern is only allowed in doc comments.",
        applies_to_build_script: false,
        accept: stars_outside_docs,
    },
    Rule {
        name: "all-uppercase comments",
        pattern: r"(//|/\*).*",
        guidance: "Comments where every letter is uppercase are not allowed.",
        applies_to_build_script: false,
        accept: all_uppercase_comment,
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        guidance: "#[allow(dead_code)] is forbidden. Use the code or delete it.",
        applies_to_build_script: false,
        accept: always,
    },
];

fn source_files() -> Vec<PathBuf> {
    WalkDir::new(".")
        .into_iter()
        .filter_entry(|e| !SKIPPED_ROOTS.iter().any(|root| e.path().starts_with(root)))
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.path().to_path_buf())
        .collect()
}

fn enforce_source_policy() -> Result<(), Box<dyn Error>> {
    let files = source_files();
    let mut searcher = Searcher::new();
    for rule in &RULES {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
        for path in &files {
            let is_build_script = path.file_name().is_some_and(|n| n == "build.rs");
            if is_build_script && !rule.applies_to_build_script {
                continue;
            }
            let mut collector = RuleCollector::new(rule, path);
            searcher.search_path(&matcher, path, &mut collector)?;
            if let Some(message) = collector.error_message() {
                return Err(message.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=engine");
    println!("cargo:rerun-if-changed=cli");
    println!("cargo:rerun-if-changed=tests");
    println!("cargo:rerun-if-changed=benches");

    if let Err(e) = enforce_source_policy() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
