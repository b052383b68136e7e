use std::path::{Component, Path};

use crate::error::{PathViolation, Result, TaskError};
use crate::task::{ContextValue, TaskContext};

use super::spec::{OutputQualifier, OutputSpec};

const GLOB_META: &[char] = &['*', '?', '[', ']', '{', '}', '\\'];

/// Resolves an output declaration into patterns relative to `work_dir`.
///
/// Pure path computation: an empty target yields an empty list, and it is up
/// to the collector to decide whether that is an error.
pub fn resolve(spec: &OutputSpec, ctx: &TaskContext, work_dir: &Path) -> Result<Vec<String>> {
    let value = spec.target.evaluate(ctx)?;
    if value.is_empty() {
        return Ok(Vec::new());
    }

    let glob = spec.options.glob;
    match value {
        ContextValue::Path(p) => Ok(vec![relativize_path(&p, work_dir, glob)?]),
        ContextValue::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                resolve_item(item, work_dir, glob, &mut out)?;
            }
            Ok(out)
        }
        ContextValue::Str(s) if spec.qualifier == OutputQualifier::File && s.contains(':') => s
            .split(':')
            .filter(|seg| !seg.is_empty())
            .map(|seg| relativize_str(seg, work_dir))
            .collect(),
        ContextValue::Str(s) => Ok(vec![relativize_str(&s, work_dir)?]),
        ContextValue::Null => Ok(Vec::new()),
    }
}

fn resolve_item(
    item: &ContextValue,
    work_dir: &Path,
    glob: bool,
    out: &mut Vec<String>,
) -> Result<()> {
    match item {
        ContextValue::Null => {}
        ContextValue::Path(p) => out.push(relativize_path(p, work_dir, glob)?),
        ContextValue::Str(s) => out.push(relativize_str(s, work_dir)?),
        ContextValue::List(items) => {
            for nested in items {
                resolve_item(nested, work_dir, glob, out)?;
            }
        }
    }
    Ok(())
}

/// Literal output name. Relative names come back unchanged; absolute ones
/// must live under `work_dir` and are returned relative to it.
pub fn relativize_str(name: &str, work_dir: &Path) -> Result<String> {
    if !name.starts_with('/') {
        ensure_contained(Path::new(name), name)?;
        return Ok(name.to_string());
    }

    let root = work_dir.to_string_lossy();
    let root = root.trim_end_matches('/');
    let rest = match name.strip_prefix(root) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return Err(TaskError::illegal_path(name, PathViolation::OutsideWorkDir)),
    };
    if rest.len() < 2 {
        return Err(TaskError::illegal_path(name, PathViolation::MissingFileName));
    }

    let relative = &rest[1..];
    ensure_contained(Path::new(relative), name)?;
    Ok(relative.to_string())
}

/// Structured path value. The result is glob-escaped when `glob` is set so
/// that names containing wildcard characters only match themselves.
pub fn relativize_path(path: &Path, work_dir: &Path, glob: bool) -> Result<String> {
    let display = path.to_string_lossy();
    let relative = if path.is_absolute() {
        let rel = path
            .strip_prefix(work_dir)
            .map_err(|_| TaskError::illegal_path(&*display, PathViolation::OutsideWorkDir))?;
        if rel.as_os_str().is_empty() {
            return Err(TaskError::illegal_path(
                &*display,
                PathViolation::MissingFileName,
            ));
        }
        rel
    } else {
        path
    };

    ensure_contained(relative, &display)?;
    let relative = relative.to_string_lossy();
    Ok(if glob {
        escape_glob(&relative)
    } else {
        relative.into_owned()
    })
}

/// Backslash-escapes every glob metacharacter.
pub fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if GLOB_META.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Rejects relative names that climb above the directory they are joined to.
fn ensure_contained(relative: &Path, original: &str) -> Result<()> {
    let mut depth: usize = 0;
    for comp in relative.components() {
        match comp {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    TaskError::illegal_path(original, PathViolation::OutsideWorkDir)
                })?;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(TaskError::illegal_path(original, PathViolation::OutsideWorkDir))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{OutputOptions, OutputTarget};
    use std::path::PathBuf;

    fn wd() -> PathBuf {
        PathBuf::from("/work/abc123")
    }

    fn violation(r: Result<String>) -> PathViolation {
        match r {
            Err(TaskError::IllegalOutputPath { violation, .. }) => violation,
            other => panic!("expected illegal path, got {other:?}"),
        }
    }

    #[test]
    fn relative_names_are_returned_unchanged() {
        for name in ["result.txt", "out/*.bam", "a b.txt", "dir/./x", "x/../y"] {
            assert_eq!(relativize_str(name, &wd()).unwrap(), name);
        }
    }

    #[test]
    fn absolute_name_inside_work_dir() {
        assert_eq!(
            relativize_str("/work/abc123/result.txt", &wd()).unwrap(),
            "result.txt"
        );
        assert_eq!(
            relativize_str("/work/abc123/sub/r.txt", &wd()).unwrap(),
            "sub/r.txt"
        );
    }

    #[test]
    fn absolute_name_outside_work_dir() {
        for name in ["/etc/passwd", "/work/abc1234/x", "/work/abc12/x", "/work"] {
            assert_eq!(
                violation(relativize_str(name, &wd())),
                PathViolation::OutsideWorkDir,
                "{name}"
            );
        }
    }

    #[test]
    fn parent_traversal_is_rejected() {
        assert_eq!(
            violation(relativize_str("/work/abc123/../etc/passwd", &wd())),
            PathViolation::OutsideWorkDir
        );
        assert_eq!(
            violation(relativize_path(
                Path::new("/work/abc123/../etc/passwd"),
                &wd(),
                true
            )),
            PathViolation::OutsideWorkDir
        );
        assert_eq!(
            violation(relativize_str("../secret", &wd())),
            PathViolation::OutsideWorkDir
        );
    }

    #[test]
    fn work_dir_itself_has_no_file_name() {
        assert_eq!(
            violation(relativize_str("/work/abc123", &wd())),
            PathViolation::MissingFileName
        );
        assert_eq!(
            violation(relativize_str("/work/abc123/", &wd())),
            PathViolation::MissingFileName
        );
        assert_eq!(
            violation(relativize_path(Path::new("/work/abc123"), &wd(), true)),
            PathViolation::MissingFileName
        );
    }

    #[test]
    fn path_values_are_glob_escaped() {
        let p = Path::new("/work/abc123/data[1]*.txt");
        assert_eq!(
            relativize_path(p, &wd(), true).unwrap(),
            "data\\[1\\]\\*.txt"
        );
        assert_eq!(relativize_path(p, &wd(), false).unwrap(), "data[1]*.txt");
        assert_eq!(
            relativize_path(Path::new("q?.txt"), &wd(), true).unwrap(),
            "q\\?.txt"
        );
    }

    #[test]
    fn path_outside_work_dir() {
        assert_eq!(
            violation(relativize_path(Path::new("/tmp/x"), &wd(), true)),
            PathViolation::OutsideWorkDir
        );
    }

    #[test]
    fn empty_target_resolves_to_nothing() {
        let mut ctx = TaskContext::new();
        ctx.insert("none".into(), ContextValue::Null);
        let spec = OutputSpec {
            target: OutputTarget::Var { var: "none".into() },
            qualifier: OutputQualifier::Path,
            options: OutputOptions::default(),
        };
        assert!(resolve(&spec, &ctx, &wd()).unwrap().is_empty());
        assert!(resolve(&OutputSpec::path(""), &ctx, &wd()).unwrap().is_empty());
    }

    #[test]
    fn single_absolute_literal() {
        let spec = OutputSpec::path("/work/abc123/result.txt");
        assert_eq!(
            resolve(&spec, &TaskContext::new(), &wd()).unwrap(),
            vec!["result.txt"]
        );
    }

    #[test]
    fn legacy_colon_list() {
        let spec = OutputSpec::file("a.txt:b.txt");
        assert_eq!(
            resolve(&spec, &TaskContext::new(), &wd()).unwrap(),
            vec!["a.txt", "b.txt"]
        );
    }

    #[test]
    fn colon_is_literal_for_path_qualifier() {
        let spec = OutputSpec::path("a.txt:b.txt");
        assert_eq!(
            resolve(&spec, &TaskContext::new(), &wd()).unwrap(),
            vec!["a.txt:b.txt"]
        );
    }

    #[test]
    fn list_keeps_order_and_duplicates() {
        let mut ctx = TaskContext::new();
        ctx.insert(
            "outs".into(),
            ContextValue::List(vec![
                ContextValue::Path("/work/abc123/z.txt".into()),
                ContextValue::Path("a.txt".into()),
                ContextValue::Path("/work/abc123/z.txt".into()),
            ]),
        );
        let spec = OutputSpec {
            target: OutputTarget::Var { var: "outs".into() },
            qualifier: OutputQualifier::Path,
            options: OutputOptions::default(),
        };
        assert_eq!(
            resolve(&spec, &ctx, &wd()).unwrap(),
            vec!["z.txt", "a.txt", "z.txt"]
        );
    }

    #[test]
    fn list_entries_are_validated_independently() {
        let mut ctx = TaskContext::new();
        ctx.insert(
            "outs".into(),
            ContextValue::List(vec![
                ContextValue::Path("ok.txt".into()),
                ContextValue::Path("/elsewhere/bad.txt".into()),
            ]),
        );
        let spec = OutputSpec {
            target: OutputTarget::Var { var: "outs".into() },
            qualifier: OutputQualifier::Path,
            options: OutputOptions::default(),
        };
        assert!(matches!(
            resolve(&spec, &ctx, &wd()),
            Err(TaskError::IllegalOutputPath { .. })
        ));
    }

    #[test]
    fn trailing_slash_on_work_dir() {
        let wd = PathBuf::from("/work/abc123/");
        assert_eq!(relativize_str("/work/abc123/r.txt", &wd).unwrap(), "r.txt");
    }
}
