//! Installing handlers below the exec root.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use log::error;
use crate::config::{Config, HandlerKind};
use crate::error::Failed;


//------------ deploy --------------------------------------------------------

/// Copies a handler into the exec root and returns its final path.
///
/// A plain file keeps its file name unless `name` says otherwise; a name
/// without an extension keeps the source’s extension so the interpreter
/// mapping still works. Subprocess handlers get their executable bit
/// set. A directory is copied recursively under its own name.
pub fn deploy(
    config: &Config, source: &Path, name: Option<&str>
) -> Result<PathBuf, Failed> {
    if source.is_dir() {
        return deploy_dir(config, source, name)
    }
    if !source.is_file() {
        error!(
            "Fatal: handler {} does not exist or is not a file.",
            source.display()
        );
        return Err(Failed)
    }
    let file_name = match dest_file_name(source, name) {
        Some(file_name) => file_name,
        None => {
            error!(
                "Fatal: cannot derive a handler name from {}.",
                source.display()
            );
            return Err(Failed)
        }
    };
    if let Err(err) = fs::create_dir_all(&config.exec_root) {
        error!(
            "Fatal: failed to create exec root {}: {}",
            config.exec_root.display(), err
        );
        return Err(Failed)
    }
    let dest = config.exec_root.join(file_name);
    if let Err(err) = fs::copy(source, &dest) {
        error!(
            "Fatal: failed to copy {} to {}: {}",
            source.display(), dest.display(), err
        );
        return Err(Failed)
    }
    if matches!(config.handler_kind, HandlerKind::Subprocess) {
        if let Err(err) = fs::set_permissions(
            &dest, fs::Permissions::from_mode(0o755)
        ) {
            error!(
                "Fatal: failed to mark {} executable: {}",
                dest.display(), err
            );
            return Err(Failed)
        }
    }
    Ok(dest)
}

/// Copies a handler directory below the exec root.
fn deploy_dir(
    config: &Config, source: &Path, name: Option<&str>
) -> Result<PathBuf, Failed> {
    let dir_name = match name {
        Some(name) => {
            if name.is_empty() || name.contains('/') || name.contains("..") {
                error!("Fatal: invalid handler name '{}'.", name);
                return Err(Failed)
            }
            name.to_string()
        }
        None => {
            match source.file_name().and_then(|name| name.to_str()) {
                Some(name) => name.into(),
                None => {
                    error!(
                        "Fatal: cannot derive a handler name from {}.",
                        source.display()
                    );
                    return Err(Failed)
                }
            }
        }
    };
    let dest = config.exec_root.join(dir_name);
    if let Err(err) = copy_tree(source, &dest) {
        error!(
            "Fatal: failed to copy {} to {}: {}",
            source.display(), dest.display(), err
        );
        return Err(Failed)
    }
    Ok(dest)
}

/// Recursively copies a directory.
fn copy_tree(source: &Path, dest: &Path) -> Result<(), std::io::Error> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        }
        else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Determines the file name to install the handler under.
fn dest_file_name(source: &Path, name: Option<&str>) -> Option<String> {
    let source_name = source.file_name()?.to_str()?;
    let name = match name {
        Some(name) => name,
        None => return Some(source_name.into()),
    };
    if name.is_empty() {
        return None
    }
    if name.contains('/') || name.contains("..") {
        return None
    }
    // Carry the source’s extension over if the name doesn’t bring one.
    if Path::new(name).extension().is_none() {
        if let Some(ext) = source.extension().and_then(|ext| ext.to_str()) {
            return Some(format!("{}.{}", name, ext))
        }
    }
    Some(name.into())
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(exec_root: &Path) -> Config {
        Config {
            exec_root: exec_root.into(),
            .. Config::default()
        }
    }

    #[test]
    fn deploy_keeps_name_and_marks_executable() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("hello.py");
        fs::write(&source, "print('hello')\n").unwrap();
        let root = dir.path().join("handlers");

        let dest = deploy(&test_config(&root), &source, None).unwrap();
        assert_eq!(dest, root.join("hello.py"));
        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn deploy_renames_with_extension() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("hello.py");
        fs::write(&source, "print('hello')\n").unwrap();
        let root = dir.path().join("handlers");

        let dest = deploy(
            &test_config(&root), &source, Some("greeter")
        ).unwrap();
        assert_eq!(dest, root.join("greeter.py"));
    }

    #[test]
    fn deploy_rejects_traversal_names() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("hello.py");
        fs::write(&source, "print('hello')\n").unwrap();
        let root = dir.path().join("handlers");

        assert!(deploy(
            &test_config(&root), &source, Some("../evil")
        ).is_err());
        assert!(deploy(
            &test_config(&root), &source, Some("a/b")
        ).is_err());
    }

    #[test]
    fn deploy_rejects_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        assert!(deploy(
            &test_config(dir.path()),
            &dir.path().join("nonexistent.py"),
            None
        ).is_err());
    }

    #[test]
    fn deploy_copies_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("bundle");
        fs::create_dir_all(source.join("lib")).unwrap();
        fs::write(source.join("main.py"), "print('hi')\n").unwrap();
        fs::write(source.join("lib").join("util.py"), "x = 1\n").unwrap();
        let root = dir.path().join("handlers");

        let dest = deploy(&test_config(&root), &source, None).unwrap();
        assert_eq!(dest, root.join("bundle"));
        assert!(dest.join("main.py").is_file());
        assert!(dest.join("lib").join("util.py").is_file());
    }

    #[test]
    fn wasm_handlers_not_marked_executable() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("echo.wasm");
        fs::write(&source, b"\0asm").unwrap();
        let root = dir.path().join("handlers");
        let mut config = test_config(&root);
        config.handler_kind = HandlerKind::WasmModule;

        let dest = deploy(&config, &source, None).unwrap();
        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0);
    }
}
