use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are policed.
const SOURCE_DIRS: [&str; 7] = [
    "pipeline", "forest", "policy", "report", "src", "tests", "benches",
];

/// One policy the source tree must follow.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    advice: &'static str,
    accept: fn(&str) -> bool,
}

// Collects every offending line of a single file.
struct LineCollector {
    file_path: PathBuf,
    accept: fn(&str) -> bool,
    violations: Vec<String>,
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if !(self.accept)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

impl LineCollector {
    fn error_message(&self, rule: &Rule) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            rule.name,
            self.file_path.display()
        );
        for violation in &self.violations {
            msg.push_str(&format!("   {violation}\n"));
        }
        msg.push_str(&format!("\n⚠️ {}\n", rule.advice));
        Some(msg)
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//")
}

// `let _ = ...` discards a value on purpose and is allowed; anything else that
// starts with an underscore hides an unused binding.
fn underscore_ok(line: &str) -> bool {
    if is_comment(line) {
        return true;
    }
    line.split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn rules() -> [Rule; 3] {
    [
        Rule {
            name: "underscore-prefixed bindings",
            pattern: r"(^|[^A-Za-z0-9_])_[A-Za-z0-9][A-Za-z0-9_]*\b",
            advice: "Use the binding or remove it. Underscore prefixes are not allowed.",
            accept: underscore_ok,
        },
        Rule {
            name: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
            advice: "Either use the code or remove it completely.",
            accept: |_| false,
        },
        Rule {
            name: "changelog-style comments",
            pattern: r"//.*\b(FIXED|CORRECTED|FIX|NEW|CHANGED|MODIFIED|UPDATED)\b",
            advice: "Comments describe the code as it is, not how it got there.",
            accept: |_| false,
        },
    ]
}

fn source_files() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
}

fn scan(path: &Path, rule: &Rule, searcher: &mut Searcher) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut collector = LineCollector {
        file_path: path.to_path_buf(),
        accept: rule.accept,
        violations: Vec::new(),
    };
    searcher.search_path(&matcher, path, &mut collector)?;
    match collector.error_message(rule) {
        Some(msg) => Err(msg.into()),
        None => Ok(()),
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let mut searcher = Searcher::new();
    let rules = rules();
    for path in source_files() {
        for rule in &rules {
            if let Err(e) = scan(&path, rule, &mut searcher) {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    }
}
