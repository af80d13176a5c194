use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources.
const SOURCE_ROOTS: [&str; 4] = ["lfs", "src", "tests", "benches"];

/// One source rule: a line regex, a filter deciding whether a matched line really breaks
/// the rule, and the hint printed when it does.
struct Rule {
    what: &'static str,
    pattern: &'static str,
    offends: fn(&str) -> bool,
    hint: &'static str,
    scan_build_script: bool,
}

const RULES: [Rule; 5] = [
    Rule {
        what: "underscore-prefixed names",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        offends: underscore_in_code,
        hint: "Use the binding or remove it; underscore prefixes are not allowed.",
        scan_build_script: true,
    },
    Rule {
        what: "change-log words in comments",
        pattern: r"(//|/\*|///).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)",
        offends: always,
        hint: "Comments describe the code as it is, not how it got there.",
        scan_build_script: false,
    },
    Rule {
        what: "'**' in plain comments",
        pattern: r"(//|/\*).*\*\*",
        offends: outside_doc_comment,
        hint: "Emphasis markers belong in doc comments only.",
        scan_build_script: false,
    },
    Rule {
        what: "all-caps comments",
        pattern: r"(//|/\*|///).*",
        offends: all_caps_comment,
        hint: "Write the comment in sentence case or delete it.",
        scan_build_script: false,
    },
    Rule {
        what: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        offends: always,
        hint: "Use the item or remove it.",
        scan_build_script: false,
    },
];

// Collects the offending lines of one file.
struct Collector {
    offends: fn(&str) -> bool,
    violations: Vec<String>,
}

impl Sink for Collector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.offends)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn always(_: &str) -> bool {
    true
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

fn outside_doc_comment(line: &str) -> bool {
    !is_doc_comment(line)
}

// Comment lines and quoted text are skipped.
fn underscore_in_code(line: &str) -> bool {
    let is_comment = line.trim_start().starts_with("//")
        || (line.contains("/*") && !line.contains("*/match") && !line.contains("*/let"));
    let in_string = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !is_comment && !in_string
}

fn all_caps_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    let text = if let Some(rest) = trimmed.strip_prefix("///") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        rest
    } else if let Some(idx) = line.find("/*") {
        let rest = &line[idx + 2..];
        rest.find("*/").map_or(rest, |end| &rest[..end])
    } else {
        return false;
    };
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    lint_build_script();

    for rule in &RULES {
        if let Err(e) = scan(rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

// Every .rs file under the source roots, in a stable order.
fn rust_sources(include_build_script: bool) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = SOURCE_ROOTS
        .iter()
        .flat_map(|root| {
            WalkDir::new(root)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
        })
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect();
    if include_build_script {
        files.push(PathBuf::from("build.rs"));
    }
    files
}

fn scan(rule: &Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();
    for path in rust_sources(rule.scan_build_script) {
        let mut collector = Collector {
            offends: rule.offends,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, &path, &mut collector)?;
        if !collector.violations.is_empty() {
            let mut msg = format!(
                "\nerror: {} {} in {}:\n",
                collector.violations.len(),
                rule.what,
                path.display()
            );
            for violation in &collector.violations {
                msg.push_str(&format!("   {violation}\n"));
            }
            msg.push_str(&format!("   {}\n", rule.hint));
            return Err(msg.into());
        }
    }
    Ok(())
}

// Type-check build.rs alone with unused items denied.
fn lint_build_script() {
    let Some(out_dir) = std::env::var_os("OUT_DIR") else {
        println!("cargo:warning=OUT_DIR is not set; skipping the build.rs lint pass");
        return;
    };
    let output = std::process::Command::new("rustc")
        .args([
            "--edition",
            "2024",
            "-D",
            "unused_variables",
            "-D",
            "dead_code",
            "-D",
            "unused_imports",
            "--crate-type",
            "bin",
            "--emit",
            "metadata",
        ])
        .arg("--out-dir")
        .arg(&out_dir)
        .arg(Path::new("build.rs"))
        .output();
    match output {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("unused variable")
                || stderr.contains("is never used")
                || stderr.contains("unused import")
            {
                eprintln!("\nerror: build.rs has unused code:");
                eprintln!("{stderr}");
                std::process::exit(1);
            }
        }
        Ok(_) => {}
        Err(e) => println!("cargo:warning=Could not lint build.rs with rustc: {e}"),
    }
}
