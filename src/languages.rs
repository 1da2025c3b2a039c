//! Toolchain profiles and command resolution.
//!
//! A language identifier maps to a [`ToolchainProfile`] loaded from a TOML
//! table at startup. Resolution turns a profile plus an entry-point file name
//! into an explicit [`CommandPipeline`]: zero or more compile steps followed
//! by exactly one run step, each an argv list. Commands are never assembled
//! as interpolated shell strings.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::Context;
use serde::Deserialize;

use crate::error::ExecError;
use crate::workspace::SourceFile;

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct ToolchainProfile {
    /// Canonical source file extension (e.g. "cpp")
    pub extension: String,
    /// Compile command template (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run command template
    pub run_command: Vec<String>,
    /// Apply the unbuffered-stdout source patch before writing files
    pub stdout_patch: bool,
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawToolchainProfile {
    extension: String,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    stdout_patch: bool,
    #[serde(default)]
    aliases: Vec<String>,
}

/// One step of a command pipeline: a program and its arguments
#[derive(Debug, Clone, PartialEq)]
pub struct CommandStep {
    pub program: String,
    pub args: Vec<String>,
}

/// Compile-then-run pipeline resolved for one execution.
///
/// Compile steps run to completion first; a non-zero exit short-circuits the
/// pipeline and its diagnostics surface as the program's own output.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    pub compile: Vec<CommandStep>,
    pub run: CommandStep,
}

/// A fully resolved execution request: patched sources plus the pipeline
#[derive(Debug)]
pub struct PreparedRun {
    /// Entry-point file name (first submitted file)
    pub entry: String,
    pub files: Vec<SourceFile>,
    pub pipeline: CommandPipeline,
}

/// Global toolchain profiles
static LANGUAGES: OnceLock<HashMap<String, ToolchainProfile>> = OnceLock::new();

/// Initialize toolchain profiles, from `LANGUAGES_CONFIG` if set, otherwise
/// from the table embedded at build time.
pub fn init_languages() -> anyhow::Result<()> {
    let content = match std::env::var("LANGUAGES_CONFIG") {
        Ok(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read language config {}", path))?,
        Err(_) => {
            include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml")).to_string()
        }
    };

    let languages = load_profiles(&content)?;

    LANGUAGES
        .set(languages)
        .map_err(|_| anyhow::anyhow!("Languages already initialized"))?;

    Ok(())
}

fn load_profiles(content: &str) -> anyhow::Result<HashMap<String, ToolchainProfile>> {
    let raw_profiles: HashMap<String, RawToolchainProfile> = toml::from_str(content)?;

    let mut languages = HashMap::new();

    for (name, raw) in raw_profiles {
        let run_command = into_command(&raw.run_command);
        if run_command.is_empty() {
            anyhow::bail!("Empty run command for language {}", name);
        }

        let profile = ToolchainProfile {
            extension: raw.extension,
            compile_command: raw.compile_command.map(|cmd| into_command(&cmd)),
            run_command,
            stdout_patch: raw.stdout_patch,
        };

        languages.insert(name.to_lowercase(), profile.clone());

        for alias in raw.aliases {
            languages.insert(alias.to_lowercase(), profile.clone());
        }
    }

    Ok(languages)
}

/// Get the toolchain profile for a language identifier or alias
pub fn get_profile(language: &str) -> Option<ToolchainProfile> {
    LANGUAGES.get()?.get(&language.to_lowercase()).cloned()
}

/// Get all supported language identifiers
pub fn supported_languages() -> Vec<String> {
    LANGUAGES
        .get()
        .map(|langs| langs.keys().cloned().collect())
        .unwrap_or_default()
}

/// Resolve a submission into a [`PreparedRun`]: looks up the profile, applies
/// source patches, and builds the command pipeline for the entry file.
///
/// Rejected submissions never reach the workspace or spawn a process.
pub fn prepare_run(language: &str, files: Vec<SourceFile>) -> Result<PreparedRun, ExecError> {
    if files.is_empty() {
        return Err(ExecError::EmptySubmission);
    }

    let profile = get_profile(language)
        .ok_or_else(|| ExecError::UnsupportedLanguage(language.to_string()))?;

    let entry = files[0].name.clone();
    let pipeline = profile.pipeline(&entry);
    let files = profile.prepare_sources(files);

    Ok(PreparedRun {
        entry,
        files,
        pipeline,
    })
}

impl ToolchainProfile {
    /// Build the command pipeline for the given entry-point file name
    pub fn pipeline(&self, entry_file: &str) -> CommandPipeline {
        let stem = entry_file
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(entry_file);

        let substitute = |template: &[String]| -> CommandStep {
            let argv: Vec<String> = template
                .iter()
                .map(|part| part.replace("{file}", entry_file).replace("{stem}", stem))
                .collect();
            CommandStep {
                program: argv[0].clone(),
                args: argv[1..].to_vec(),
            }
        };

        let compile = self
            .compile_command
            .as_deref()
            .filter(|cmd| !cmd.is_empty())
            .map(|cmd| vec![substitute(cmd)])
            .unwrap_or_default();

        CommandPipeline {
            compile,
            run: substitute(&self.run_command),
        }
    }

    /// Apply pre-write source transformations for this language
    pub fn prepare_sources(&self, files: Vec<SourceFile>) -> Vec<SourceFile> {
        if !self.stdout_patch {
            return files;
        }

        files
            .into_iter()
            .map(|mut file| {
                file.content = apply_unbuffered_stdout_patch(&file.content);
                file
            })
            .collect()
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

/// Inject an unbuffered-stdout directive at the top of `main`.
///
/// C/C++ programs block-buffer stdout when it is a pipe, so an interactive
/// program that prompts before reading stdin appears frozen to the client.
/// The directive forces immediate delivery. Sources without a recognizable
/// `main` body are returned unchanged.
pub fn apply_unbuffered_stdout_patch(source: &str) -> String {
    const DIRECTIVE: &str = "setvbuf(stdout, NULL, _IONBF, 0);";

    let Some(brace) = find_main_body_open(source) else {
        return source.to_string();
    };

    let mut patched = String::with_capacity(source.len() + DIRECTIVE.len() + 8);
    patched.push_str(&source[..=brace]);
    patched.push_str("\n    ");
    patched.push_str(DIRECTIVE);
    patched.push_str(&source[brace + 1..]);
    patched
}

/// Byte offset of the opening brace of `main`'s body, if present
fn find_main_body_open(source: &str) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut search = 0;

    while let Some(rel) = source[search..].find("main") {
        let at = search + rel;
        search = at + 4;

        // `main` must be a standalone identifier
        let boundary_before = at == 0 || !is_ident_byte(bytes[at - 1]);
        let boundary_after = at + 4 >= bytes.len() || !is_ident_byte(bytes[at + 4]);
        if !boundary_before || !boundary_after {
            continue;
        }

        // Parameter list follows, possibly after whitespace
        let mut i = at + 4;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'(' {
            continue;
        }

        // Matching close paren
        let mut depth = 0usize;
        while i < bytes.len() {
            match bytes[i] {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        if i >= bytes.len() {
            return None;
        }

        // Body brace (skips prototypes ending in `;`)
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i < bytes.len() && bytes[i] == b'{' {
            return Some(i);
        }
    }

    None
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMBEDDED: &str =
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

    #[test]
    fn embedded_table_covers_all_languages() {
        let profiles = load_profiles(EMBEDDED).unwrap();

        for lang in ["java", "python", "javascript", "c", "cpp", "csharp"] {
            assert!(profiles.contains_key(lang), "missing profile for {}", lang);
        }

        // Aliases resolve to the same profile
        assert_eq!(profiles["py"].run_command, profiles["python"].run_command);
        assert_eq!(profiles["js"].extension, "js");
    }

    #[test]
    fn compiled_languages_have_two_stage_pipelines() {
        let profiles = load_profiles(EMBEDDED).unwrap();

        let java = profiles["java"].pipeline("Solution.java");
        assert_eq!(java.compile.len(), 1);
        assert_eq!(java.compile[0].program, "javac");
        assert_eq!(java.compile[0].args, vec!["Solution.java"]);
        assert_eq!(java.run.program, "java");
        assert_eq!(java.run.args, vec!["Solution"]);

        let csharp = profiles["csharp"].pipeline("Program.cs");
        assert_eq!(csharp.run.program, "mono");
        assert_eq!(csharp.run.args, vec!["Program.exe"]);

        let c = profiles["c"].pipeline("prog.c");
        assert_eq!(c.compile[0].args, vec!["prog.c", "-o", "prog"]);
        assert_eq!(c.run.program, "./prog");
    }

    #[test]
    fn interpreted_languages_have_no_compile_step() {
        let profiles = load_profiles(EMBEDDED).unwrap();

        let python = profiles["python"].pipeline("main.py");
        assert!(python.compile.is_empty());
        assert_eq!(python.run.program, "python3");
        assert_eq!(python.run.args, vec!["-u", "main.py"]);
    }

    #[test]
    fn only_c_family_is_patched() {
        let profiles = load_profiles(EMBEDDED).unwrap();

        assert!(profiles["c"].stdout_patch);
        assert!(profiles["cpp"].stdout_patch);
        assert!(!profiles["python"].stdout_patch);
        assert!(!profiles["java"].stdout_patch);
    }

    #[test]
    fn unsupported_language_is_rejected_before_resolution() {
        let err = prepare_run("ruby", vec![SourceFile::new("main.rb", "puts 1")]).unwrap_err();
        assert!(matches!(err, ExecError::UnsupportedLanguage(_)));

        let err = prepare_run("python", vec![]).unwrap_err();
        assert!(matches!(err, ExecError::EmptySubmission));
    }

    #[test]
    fn patch_injects_directive_after_main_brace() {
        let source =
            "#include <stdio.h>\nint main(void) {\n    printf(\"hi\");\n    return 0;\n}\n";
        let patched = apply_unbuffered_stdout_patch(source);

        let brace = patched.find("main(void) {").unwrap();
        let directive = patched.find("setvbuf(stdout, NULL, _IONBF, 0);").unwrap();
        assert!(directive > brace);
        assert!(directive < patched.find("printf").unwrap());
    }

    #[test]
    fn patch_handles_brace_on_next_line() {
        let source = "int main(int argc, char **argv)\n{\n    return 0;\n}\n";
        let patched = apply_unbuffered_stdout_patch(source);
        assert!(patched.contains("{\n    setvbuf(stdout, NULL, _IONBF, 0);"));
    }

    #[test]
    fn patch_ignores_identifiers_containing_main() {
        let source = "int domain(void) {\n    return 0;\n}\n";
        assert_eq!(apply_unbuffered_stdout_patch(source), source);

        let source = "int mainline = 3;\n";
        assert_eq!(apply_unbuffered_stdout_patch(source), source);
    }

    #[test]
    fn patch_leaves_sources_without_main_untouched() {
        let source = "static int helper(void) { return 1; }\n";
        assert_eq!(apply_unbuffered_stdout_patch(source), source);
    }
}
