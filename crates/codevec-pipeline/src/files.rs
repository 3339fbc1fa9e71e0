//! Input path expansion and gitignore-style include/exclude specs.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::Result;

pub const SPEC_DIR: &str = ".codevec";
pub const INCLUDE_FILE: &str = "include";
pub const EXCLUDE_FILE: &str = "exclude";

fn is_glob(input: &str) -> bool {
    input.contains(['*', '?', '['])
}

fn walk(dir: &Path, recursive: bool, include_hidden: bool, out: &mut BTreeSet<PathBuf>) {
    let walker = WalkBuilder::new(dir)
        .standard_filters(false)
        .hidden(!include_hidden)
        .max_depth(if recursive { None } else { Some(1) })
        .filter_entry(|e| e.file_name() != ".git")
        .build();
    for entry in walker {
        match entry {
            Ok(e) if e.file_type().is_some_and(|ft| ft.is_file()) => {
                out.insert(e.into_path());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("skipping unreadable entry: {e}"),
        }
    }
}

/// Expand files, directories and glob patterns into a sorted list of
/// absolute file paths. Relative inputs are resolved against `base`.
///
/// Directories contribute their direct children, or their whole subtree when
/// `recursive`. Hidden entries are skipped unless `include_hidden`.
///
/// # Errors
///
/// Returns an error for malformed glob patterns.
pub fn expand_paths(
    inputs: &[String],
    base: &Path,
    recursive: bool,
    include_hidden: bool,
) -> Result<Vec<PathBuf>> {
    let mut out = BTreeSet::new();
    let options = glob::MatchOptions {
        require_literal_leading_dot: !include_hidden,
        ..glob::MatchOptions::new()
    };

    for input in inputs {
        let path = base.join(input);
        if is_glob(input) {
            let pattern = path.to_string_lossy();
            for entry in glob::glob_with(&pattern, options)? {
                match entry {
                    Ok(p) if p.is_file() => {
                        out.insert(p);
                    }
                    Ok(p) if p.is_dir() && recursive => walk(&p, true, include_hidden, &mut out),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("glob entry unreadable: {e}"),
                }
            }
        } else if path.is_dir() {
            walk(&path, recursive, include_hidden, &mut out);
        } else if path.is_file() {
            out.insert(path);
        } else {
            tracing::warn!(path = %path.display(), "no such file or directory");
        }
    }
    Ok(out.into_iter().collect())
}

/// A gitignore-style pattern set anchored at a project root.
#[derive(Debug, Clone)]
pub struct PathSpec {
    root: PathBuf,
    matcher: Gitignore,
}

impl PathSpec {
    /// Build from every existing file in `files`; `None` if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a spec file is malformed.
    pub fn from_files(root: &Path, files: &[PathBuf]) -> Result<Option<Self>> {
        let mut builder = GitignoreBuilder::new(root);
        let mut loaded = false;
        for file in files.iter().filter(|f| f.is_file()) {
            if let Some(err) = builder.add(file) {
                return Err(err.into());
            }
            tracing::debug!(spec = %file.display(), "loaded path spec");
            loaded = true;
        }
        if !loaded {
            return Ok(None);
        }
        Ok(Some(Self {
            root: root.to_path_buf(),
            matcher: builder.build()?,
        }))
    }

    /// # Errors
    ///
    /// Returns an error if a pattern is malformed.
    pub fn from_lines<'a>(root: &Path, lines: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        for line in lines {
            builder.add_line(None, line)?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            matcher: builder.build()?,
        })
    }

    /// Whether `path` or one of its parents matches. Paths outside the root never match.
    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        self.matcher
            .matched_path_or_any_parents(relative, path.is_dir())
            .is_ignore()
    }
}

/// Include and exclude specs of a project.
///
/// Include: `<root>/.codevec/include`, else `<global>/include`.
/// Exclude: `<root>/.gitignore` plus `<root>/.codevec/exclude`, else `<global>/exclude`.
/// A recursive load also picks up every nested `.gitignore` and
/// `.codevec/exclude`, each anchored at its own directory.
#[derive(Debug, Clone, Default)]
pub struct SpecFiles {
    pub include: Option<PathSpec>,
    pub exclude: Vec<PathSpec>,
}

fn local_or_global(root: &Path, global_dir: Option<&Path>, name: &str) -> Option<PathBuf> {
    let local = root.join(SPEC_DIR).join(name);
    if local.is_file() {
        return Some(local);
    }
    global_dir.map(|dir| dir.join(name)).filter(|p| p.is_file())
}

/// Directory an exclude file below `root` applies to, if it is one.
fn exclude_anchor<'a>(root: &Path, file: &'a Path) -> Option<&'a Path> {
    let parent = file.parent()?;
    let anchor = match file.file_name()?.to_str()? {
        ".gitignore" => parent,
        EXCLUDE_FILE if parent.file_name() == Some(OsStr::new(SPEC_DIR)) => parent.parent()?,
        _ => return None,
    };
    (anchor != root).then_some(anchor)
}

/// Exclude specs of sub-directories, without descending into ignored ones.
fn nested_exclude_specs(root: &Path) -> Result<Vec<PathSpec>> {
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .git_ignore(true)
        .require_git(false)
        .filter_entry(|e| e.file_name() != ".git")
        .build();
    let mut specs = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) if e.file_type().is_some_and(|ft| ft.is_file()) => e,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("skipping unreadable entry: {e}");
                continue;
            }
        };
        if let Some(anchor) = exclude_anchor(root, entry.path()) {
            specs.extend(PathSpec::from_files(anchor, &[entry.path().to_path_buf()])?);
        }
    }
    Ok(specs)
}

impl SpecFiles {
    /// # Errors
    ///
    /// Returns an error if a spec file is malformed.
    pub fn load(root: &Path, global_dir: Option<&Path>, recursive: bool) -> Result<Self> {
        let include = match local_or_global(root, global_dir, INCLUDE_FILE) {
            Some(file) => PathSpec::from_files(root, &[file])?,
            None => None,
        };
        let mut exclude_files = vec![root.join(".gitignore")];
        exclude_files.extend(local_or_global(root, global_dir, EXCLUDE_FILE));
        let mut exclude: Vec<PathSpec> = PathSpec::from_files(root, &exclude_files)?.into_iter().collect();
        if recursive {
            exclude.extend(nested_exclude_specs(root)?);
        }
        Ok(Self { include, exclude })
    }

    /// Drop files matched by any exclude spec.
    #[must_use]
    pub fn filter_excluded(&self, files: Vec<PathBuf>) -> Vec<PathBuf> {
        if self.exclude.is_empty() {
            return files;
        }
        let before = files.len();
        let kept: Vec<PathBuf> = files
            .into_iter()
            .filter(|f| !self.exclude.iter().any(|spec| spec.matches(f)))
            .collect();
        tracing::debug!(excluded = before - kept.len(), "exclude spec applied");
        kept
    }

    /// Every file under `root` selected by the include spec; empty without one.
    #[must_use]
    pub fn included_files(&self, root: &Path) -> Vec<PathBuf> {
        let Some(spec) = &self.include else {
            return Vec::new();
        };
        let mut all = BTreeSet::new();
        walk(root, true, true, &mut all);
        all.into_iter().filter(|f| spec.matches(f)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::create_dir_all(root.join(".hidden")).unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(root.join("src/lib.rs"), "pub fn f() {}").unwrap();
        fs::write(root.join("src/nested/deep.rs"), "fn deep() {}").unwrap();
        fs::write(root.join("README.md"), "# readme").unwrap();
        fs::write(root.join(".hidden/secret.txt"), "x").unwrap();
        dir
    }

    fn names(root: &Path, files: &[PathBuf]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn directory_expansion_respects_recursion() {
        let dir = tree();
        let root = dir.path();
        let flat = expand_paths(&["src".into()], root, false, false).unwrap();
        assert_eq!(names(root, &flat), ["src/lib.rs", "src/main.rs"]);

        let deep = expand_paths(&["src".into()], root, true, false).unwrap();
        assert_eq!(names(root, &deep), ["src/lib.rs", "src/main.rs", "src/nested/deep.rs"]);
    }

    #[test]
    fn hidden_files_need_opt_in() {
        let dir = tree();
        let root = dir.path();
        let visible = expand_paths(&[".".into()], root, true, false).unwrap();
        assert!(!names(root, &visible).iter().any(|n| n.contains(".hidden")));

        let all = expand_paths(&[".".into()], root, true, true).unwrap();
        assert!(names(root, &all).iter().any(|n| n.contains(".hidden")));
    }

    #[test]
    fn globs_and_missing_inputs() {
        let dir = tree();
        let root = dir.path();
        let files = expand_paths(&["src/*.rs".into(), "nope.rs".into()], root, false, false).unwrap();
        assert_eq!(names(root, &files), ["src/lib.rs", "src/main.rs"]);
    }

    #[test]
    fn exclude_spec_with_negation() {
        let dir = tree();
        let root = dir.path();
        let spec = PathSpec::from_lines(root, ["src/", "!src/main.rs"]).unwrap();
        assert!(spec.matches(&root.join("src/lib.rs")));
        assert!(!spec.matches(&root.join("src/main.rs")));
        assert!(!spec.matches(&root.join("README.md")));
        assert!(!spec.matches(Path::new("/elsewhere/src/lib.rs")));
    }

    #[test]
    fn gitignore_is_used_as_exclude_spec() {
        let dir = tree();
        let root = dir.path();
        fs::write(root.join(".gitignore"), "nested/\n").unwrap();
        let specs = SpecFiles::load(root, None, false).unwrap();
        assert!(specs.include.is_none());

        let files = expand_paths(&["src".into()], root, true, false).unwrap();
        let kept = specs.filter_excluded(files);
        assert_eq!(names(root, &kept), ["src/lib.rs", "src/main.rs"]);
    }

    #[test]
    fn nested_gitignore_applies_below_its_directory() {
        let dir = tree();
        let root = dir.path();
        fs::write(root.join("src/.gitignore"), "main.rs\n").unwrap();
        fs::write(root.join("main.rs"), "fn main() {}").unwrap();
        fs::create_dir_all(root.join("src/nested").join(SPEC_DIR)).unwrap();
        fs::write(root.join("src/nested").join(SPEC_DIR).join(EXCLUDE_FILE), "*.rs\n").unwrap();
        let files = expand_paths(&[".".into()], root, true, false).unwrap();

        let flat = SpecFiles::load(root, None, false).unwrap();
        assert!(flat.exclude.is_empty());

        let specs = SpecFiles::load(root, None, true).unwrap();
        assert_eq!(specs.exclude.len(), 2);
        let kept = specs.filter_excluded(files);
        assert_eq!(names(root, &kept), ["README.md", "main.rs", "src/lib.rs"]);
    }

    #[test]
    fn local_include_spec_wins_over_global() {
        let dir = tree();
        let root = dir.path();
        let global = tempfile::tempdir().unwrap();
        fs::write(global.path().join(INCLUDE_FILE), "*.md\n").unwrap();

        let specs = SpecFiles::load(root, Some(global.path()), false).unwrap();
        assert_eq!(names(root, &specs.included_files(root)), ["README.md"]);

        fs::create_dir_all(root.join(SPEC_DIR)).unwrap();
        fs::write(root.join(SPEC_DIR).join(INCLUDE_FILE), "src/*.rs\n").unwrap();
        let specs = SpecFiles::load(root, Some(global.path()), false).unwrap();
        assert_eq!(names(root, &specs.included_files(root)), ["src/lib.rs", "src/main.rs"]);
    }
}
