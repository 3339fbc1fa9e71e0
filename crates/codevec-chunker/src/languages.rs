//! Guessing a source file's language, and the grammars compiled in.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Bash,
    Toml,
    Json,
    Markdown,
}

/// Exact file names that carry no telling extension.
const FILE_NAMES: &[(&str, Lang)] = &[
    ("Cargo.lock", Lang::Toml),
    ("Pipfile", Lang::Toml),
    ("poetry.lock", Lang::Toml),
    (".bashrc", Lang::Bash),
    (".bash_profile", Lang::Bash),
    (".zshrc", Lang::Bash),
    (".profile", Lang::Bash),
    ("PKGBUILD", Lang::Bash),
];

const EXTENSIONS: &[(&[&str], Lang)] = &[
    (&["rs"], Lang::Rust),
    (&["py", "pyi", "pyw"], Lang::Python),
    (&["js", "jsx", "mjs", "cjs"], Lang::JavaScript),
    (&["ts", "tsx", "mts", "cts"], Lang::TypeScript),
    (&["go"], Lang::Go),
    (&["sh", "bash", "zsh"], Lang::Bash),
    (&["toml"], Lang::Toml),
    (&["json", "jsonc"], Lang::Json),
    (&["md", "markdown"], Lang::Markdown),
];

/// Interpreters named on a `#!` line, version suffixes stripped.
const INTERPRETERS: &[(&str, Lang)] = &[
    ("python", Lang::Python),
    ("pypy", Lang::Python),
    ("sh", Lang::Bash),
    ("bash", Lang::Bash),
    ("zsh", Lang::Bash),
    ("dash", Lang::Bash),
    ("node", Lang::JavaScript),
    ("nodejs", Lang::JavaScript),
    ("bun", Lang::JavaScript),
    ("deno", Lang::TypeScript),
    ("ts-node", Lang::TypeScript),
];

impl Lang {
    /// Key of this language in `chunk_filters`.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
            Self::Bash => "bash",
            Self::Toml => "toml",
            Self::Json => "json",
            Self::Markdown => "markdown",
        }
    }

    /// The tree-sitter grammar, if its `lang-*` feature is enabled.
    #[must_use]
    pub fn grammar(self) -> Option<tree_sitter::Language> {
        let language: tree_sitter::Language = match self {
            #[cfg(feature = "lang-rust")]
            Self::Rust => tree_sitter_rust::LANGUAGE.into(),
            #[cfg(feature = "lang-python")]
            Self::Python => tree_sitter_python::LANGUAGE.into(),
            #[cfg(feature = "lang-js")]
            Self::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            #[cfg(feature = "lang-js")]
            Self::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            #[cfg(feature = "lang-go")]
            Self::Go => tree_sitter_go::LANGUAGE.into(),
            #[cfg(feature = "lang-config")]
            Self::Bash => tree_sitter_bash::LANGUAGE.into(),
            #[cfg(feature = "lang-config")]
            Self::Toml => tree_sitter_toml_ng::LANGUAGE.into(),
            #[cfg(feature = "lang-config")]
            Self::Json => tree_sitter_json::LANGUAGE.into(),
            #[cfg(feature = "lang-config")]
            Self::Markdown => tree_sitter_md::LANGUAGE.into(),
            #[allow(unreachable_patterns)]
            _ => return None,
        };
        Some(language)
    }
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

fn by_file_name(path: &Path) -> Option<Lang> {
    let name = path.file_name()?.to_str()?;
    if let Some((_, lang)) = FILE_NAMES.iter().find(|(n, _)| *n == name) {
        return Some(*lang);
    }
    let ext = path.extension()?.to_str()?;
    EXTENSIONS
        .iter()
        .find(|(exts, _)| exts.contains(&ext))
        .map(|(_, lang)| *lang)
}

/// Language of the interpreter on a leading `#!` line. `env` and its flags
/// are looked through; `python3.12` resolves like `python`.
fn by_shebang(source: &str) -> Option<Lang> {
    let line = source.lines().next()?.strip_prefix("#!")?;
    let mut words = line.split_whitespace();
    let mut program = words.next()?.rsplit('/').next()?;
    if program == "env" {
        program = words.find(|w| !w.starts_with('-') && !w.contains('='))?;
    }
    let program = program.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');
    INTERPRETERS
        .iter()
        .find(|(name, _)| *name == program)
        .map(|(_, lang)| *lang)
}

/// Guess the language of `source` read from `path`: well-known file names
/// first, then the extension, then a shebang line.
#[must_use]
pub fn detect_language(path: &Path, source: &str) -> Option<Lang> {
    by_file_name(path).or_else(|| by_shebang(source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_and_names() {
        let cases = [
            ("src/main.rs", Some(Lang::Rust)),
            ("tool.pyi", Some(Lang::Python)),
            ("web/app.mjs", Some(Lang::JavaScript)),
            ("web/app.tsx", Some(Lang::TypeScript)),
            ("ws/Cargo.lock", Some(Lang::Toml)),
            ("/home/u/.bashrc", Some(Lang::Bash)),
            ("file.xyz", None),
            ("Makefile", None),
        ];
        for (path, expected) in cases {
            assert_eq!(detect_language(Path::new(path), ""), expected, "{path}");
        }
    }

    #[test]
    fn shebang_names_the_interpreter() {
        let cases = [
            ("#!/usr/bin/env python3\nprint(1)\n", Some(Lang::Python)),
            ("#!/usr/bin/python3.12\n", Some(Lang::Python)),
            ("#!/bin/bash -eu\nset -x\n", Some(Lang::Bash)),
            ("#!/bin/sh\n", Some(Lang::Bash)),
            ("#!/usr/bin/env node\n", Some(Lang::JavaScript)),
            ("#!/usr/bin/env -S deno run --allow-net\n", Some(Lang::TypeScript)),
            ("#!/usr/bin/env PYTHONPATH=. python\n", Some(Lang::Python)),
            ("#!/usr/bin/perl\n", None),
            ("echo no shebang\n", None),
            ("", None),
        ];
        for (source, expected) in cases {
            assert_eq!(detect_language(Path::new("bin/tool"), source), expected, "{source:?}");
        }
    }

    #[test]
    fn file_name_wins_over_shebang() {
        let source = "#!/usr/bin/env node\n";
        assert_eq!(detect_language(Path::new("run.py"), source), Some(Lang::Python));
    }

    #[test]
    fn compiled_grammars_are_available() {
        #[cfg(feature = "lang-rust")]
        assert!(Lang::Rust.grammar().is_some());
        #[cfg(feature = "lang-python")]
        assert!(Lang::Python.grammar().is_some());
        #[cfg(feature = "lang-js")]
        assert!(Lang::TypeScript.grammar().is_some());
        #[cfg(feature = "lang-config")]
        assert!(Lang::Bash.grammar().is_some());
    }

    #[test]
    fn display_is_filter_key() {
        assert_eq!(Lang::JavaScript.to_string(), "javascript");
        assert_eq!(Lang::Markdown.to_string(), Lang::Markdown.id());
    }
}
