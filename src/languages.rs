//! Language registry: extension resolution and command templates.
//!
//! The registry is a read-only table loaded at startup, either the built-in
//! defaults or an `env.rbx.yml` document. Command templates are token lists
//! with literal substitution markers; there is no shell interpretation
//! anywhere. Template validation happens at load time so a typo'd marker is
//! a startup error, not a mid-contest surprise.


use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Markers allowed inside command templates.
const KNOWN_MARKERS: &[&str] = &[
    "compilable",
    "executable",
    "compilation_flags",
    "memory_limit",
];

/// Logical-to-physical filenames inside a sandbox workdir.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileMapping {
    /// Physical name for the source, e.g. `compilable.cpp`
    pub compilable: String,
    /// Physical name for the produced binary, e.g. `exe`
    pub executable: String,
}

/// Per-language sandbox defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LanguageSandboxDefaults {
    /// Maximum live processes in the group (VMs and interpreters fork)
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,
}

fn default_max_processes() -> u32 {
    1
}

impl Default for LanguageSandboxDefaults {
    fn default() -> Self {
        Self { max_processes: 1 }
    }
}

/// One language definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Language {
    pub name: String,
    /// Extensions matched in declared order, lowercase, no leading dot
    pub extensions: Vec<String>,
    /// Compile command sequence; executed in order, aborting on failure.
    /// Empty for pure-interpreted setups.
    #[serde(default)]
    pub compile: Vec<Vec<String>>,
    /// Run command template
    pub run: Vec<String>,
    pub file_mapping: FileMapping,
    /// Headers auto-injected into the dependency closure when present
    /// next to the source (e.g. `testlib.h`)
    #[serde(default)]
    pub injected_deps: Vec<String>,
    #[serde(default)]
    pub sandbox: LanguageSandboxDefaults,
}

/// Values substituted into a command template.
#[derive(Debug, Clone)]
pub struct TemplateVars<'a> {
    pub compilable: &'a str,
    pub executable: &'a str,
    pub compilation_flags: &'a [String],
    /// Memory limit in megabytes, for `{memory_limit}` markers
    pub memory_limit_mb: u64,
}

impl TemplateVars<'_> {
    /// Substitute this set of values into one command template.
    ///
    /// A token that is exactly `{compilation_flags}` is spliced into the
    /// argv (and dropped entirely when there are no flags); every other
    /// marker is a literal string replacement inside its token.
    pub fn substitute(&self, template: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(template.len());
        for token in template {
            if token == "{compilation_flags}" {
                argv.extend(self.compilation_flags.iter().cloned());
                continue;
            }
            let substituted = token
                .replace("{compilable}", self.compilable)
                .replace("{executable}", self.executable)
                .replace(
                    "{compilation_flags}",
                    &self.compilation_flags.join(" "),
                )
                .replace("{memory_limit}", &self.memory_limit_mb.to_string());
            argv.push(substituted);
        }
        argv
    }
}

/// The read-only language table.
#[derive(Debug, Clone)]
pub struct Registry {
    languages: Vec<Language>,
}

/// Document shape of `env.rbx.yml`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryDocument {
    languages: Vec<Language>,
}

impl Registry {
    /// The built-in language table.
    pub fn builtin() -> Self {
        let registry = Self {
            languages: builtin_languages(),
        };
        // Built-ins are validated in tests; a broken table is a bug here,
        // not a user configuration problem.
        debug_assert!(registry.validate().is_ok());
        registry
    }

    /// Load a registry from an `env.rbx.yml` document. Unknown fields and
    /// unknown template markers fail loading.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let doc: RegistryDocument = serde_yaml::from_str(text)?;
        let registry = Self {
            languages: doc.languages,
        };
        registry.validate()?;
        Ok(registry)
    }

    /// First language whose extension list contains `ext`.
    pub fn by_extension(&self, ext: &str) -> Option<&Language> {
        let ext = ext.to_ascii_lowercase();
        self.languages
            .iter()
            .find(|lang| lang.extensions.iter().any(|e| *e == ext))
    }

    /// Language with exactly this name.
    pub fn by_name(&self, tag: &str) -> Option<&Language> {
        self.languages.iter().find(|lang| lang.name == tag)
    }

    pub fn languages(&self) -> &[Language] {
        &self.languages
    }

    /// Check every template of every language for unknown markers.
    fn validate(&self) -> Result<()> {
        for language in &self.languages {
            for command in language
                .compile
                .iter()
                .chain(std::iter::once(&language.run))
            {
                for token in command {
                    if let Some(marker) = unknown_marker(token) {
                        return Err(Error::UnknownMarker {
                            language: language.name.clone(),
                            marker,
                        });
                    }
                }
            }
            if language.extensions.is_empty() {
                return Err(Error::Config(format!(
                    "language {} declares no extensions",
                    language.name
                )));
            }
        }
        Ok(())
    }
}

/// Scan a token for `{...}` markers outside the supported set.
fn unknown_marker(token: &str) -> Option<String> {
    let mut rest = token;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            return None;
        };
        let marker = &after[..close];
        if !KNOWN_MARKERS.contains(&marker) {
            return Some(marker.to_string());
        }
        rest = &after[close + 1..];
    }
    None
}

fn builtin_languages() -> Vec<Language> {
    vec![
        Language {
            name: "cpp".into(),
            extensions: vec!["cpp".into(), "cc".into(), "cxx".into(), "c++".into()],
            compile: vec![vec![
                "g++".into(),
                "-O2".into(),
                "-std=c++20".into(),
                "-o".into(),
                "{executable}".into(),
                "{compilable}".into(),
                "{compilation_flags}".into(),
            ]],
            run: vec!["./{executable}".into()],
            file_mapping: FileMapping {
                compilable: "compilable.cpp".into(),
                executable: "exe".into(),
            },
            injected_deps: vec!["testlib.h".into(), "rbx.h".into()],
            sandbox: LanguageSandboxDefaults::default(),
        },
        Language {
            name: "c".into(),
            extensions: vec!["c".into()],
            compile: vec![vec![
                "gcc".into(),
                "-O2".into(),
                "-std=c11".into(),
                "-o".into(),
                "{executable}".into(),
                "{compilable}".into(),
                "{compilation_flags}".into(),
                "-lm".into(),
            ]],
            run: vec!["./{executable}".into()],
            file_mapping: FileMapping {
                compilable: "compilable.c".into(),
                executable: "exe".into(),
            },
            injected_deps: vec![],
            sandbox: LanguageSandboxDefaults::default(),
        },
        Language {
            name: "rust".into(),
            extensions: vec!["rs".into()],
            compile: vec![vec![
                "rustc".into(),
                "-O".into(),
                "--edition".into(),
                "2021".into(),
                "-o".into(),
                "{executable}".into(),
                "{compilable}".into(),
                "{compilation_flags}".into(),
            ]],
            run: vec!["./{executable}".into()],
            file_mapping: FileMapping {
                compilable: "compilable.rs".into(),
                executable: "exe".into(),
            },
            injected_deps: vec![],
            sandbox: LanguageSandboxDefaults::default(),
        },
        Language {
            name: "python".into(),
            extensions: vec!["py".into()],
            compile: vec![
                vec![
                    "python3".into(),
                    "-m".into(),
                    "py_compile".into(),
                    "{compilable}".into(),
                ],
                vec!["cp".into(), "{compilable}".into(), "{executable}".into()],
            ],
            run: vec!["python3".into(), "{executable}".into()],
            file_mapping: FileMapping {
                compilable: "compilable.py".into(),
                executable: "exe".into(),
            },
            injected_deps: vec![],
            sandbox: LanguageSandboxDefaults { max_processes: 4 },
        },
        Language {
            name: "java".into(),
            extensions: vec!["java".into()],
            compile: vec![
                vec!["javac".into(), "{compilable}".into()],
                vec![
                    "jar".into(),
                    "cfe".into(),
                    "{executable}".into(),
                    "Main".into(),
                    "Main.class".into(),
                ],
            ],
            run: vec![
                "java".into(),
                "-Xmx{memory_limit}m".into(),
                "-jar".into(),
                "{executable}".into(),
            ],
            file_mapping: FileMapping {
                compilable: "Main.java".into(),
                executable: "exe.jar".into(),
            },
            injected_deps: vec![],
            sandbox: LanguageSandboxDefaults { max_processes: 64 },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_validates() {
        let registry = Registry::builtin();
        assert!(registry.validate().is_ok());
        assert!(registry.languages().len() >= 4);
    }

    #[test]
    fn extension_lookup_respects_declared_order() {
        let registry = Registry::builtin();
        assert_eq!(registry.by_extension("cpp").unwrap().name, "cpp");
        assert_eq!(registry.by_extension("CC").unwrap().name, "cpp");
        assert_eq!(registry.by_extension("py").unwrap().name, "python");
        assert!(registry.by_extension("zig").is_none());
    }

    #[test]
    fn name_lookup_is_exact() {
        let registry = Registry::builtin();
        assert!(registry.by_name("cpp").is_some());
        assert!(registry.by_name("CPP").is_none());
    }

    #[test]
    fn substitution_is_literal() {
        let vars = TemplateVars {
            compilable: "compilable.cpp",
            executable: "exe",
            compilation_flags: &["-DLOCAL".into(), "-g".into()],
            memory_limit_mb: 256,
        };
        let argv = vars.substitute(&[
            "g++".into(),
            "-o".into(),
            "{executable}".into(),
            "{compilable}".into(),
            "{compilation_flags}".into(),
        ]);
        assert_eq!(argv, vec!["g++", "-o", "exe", "compilable.cpp", "-DLOCAL", "-g"]);
    }

    #[test]
    fn empty_flags_token_is_dropped() {
        let vars = TemplateVars {
            compilable: "a.c",
            executable: "exe",
            compilation_flags: &[],
            memory_limit_mb: 64,
        };
        let argv = vars.substitute(&[
            "gcc".into(),
            "{compilable}".into(),
            "{compilation_flags}".into(),
        ]);
        assert_eq!(argv, vec!["gcc", "a.c"]);
    }

    #[test]
    fn memory_limit_marker_substitutes_inside_token() {
        let vars = TemplateVars {
            compilable: "Main.java",
            executable: "exe.jar",
            compilation_flags: &[],
            memory_limit_mb: 512,
        };
        let argv = vars.substitute(&["java".into(), "-Xmx{memory_limit}m".into()]);
        assert_eq!(argv[1], "-Xmx512m");
    }

    #[test]
    fn unknown_marker_fails_at_load() {
        let yaml = r#"
languages:
  - name: weird
    extensions: [w]
    compile:
      - ["wcc", "{source}", "-o", "{executable}"]
    run: ["./{executable}"]
    fileMapping: { compilable: compilable.w, executable: exe }
"#;
        match Registry::from_yaml(yaml) {
            Err(Error::UnknownMarker { marker, .. }) => assert_eq!(marker, "source"),
            other => panic!("expected unknown-marker error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_yaml_fields_fail_parsing() {
        let yaml = r#"
languages:
  - name: c
    extensions: [c]
    run: ["./exe"]
    fileMapping: { compilable: compilable.c, executable: exe }
    dockerImage: gcc:13
"#;
        assert!(Registry::from_yaml(yaml).is_err());
    }

    #[test]
    fn yaml_roundtrip_loads_custom_language() {
        let yaml = r#"
languages:
  - name: kotlin
    extensions: [kt]
    compile:
      - ["kotlinc", "{compilable}", "-include-runtime", "-d", "{executable}"]
    run: ["java", "-jar", "{executable}"]
    fileMapping: { compilable: compilable.kt, executable: exe.jar }
    sandbox: { maxProcesses: 32 }
"#;
        let registry = Registry::from_yaml(yaml).unwrap();
        let kotlin = registry.by_name("kotlin").unwrap();
        assert_eq!(kotlin.sandbox.max_processes, 32);
        assert_eq!(registry.by_extension("kt").unwrap().name, "kotlin");
    }
}
