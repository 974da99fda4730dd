use anyhow::{Context, Result};
use atomic_write_file::AtomicWriteFile;
use std::fs;
use std::io::Write;
use std::path::Path;

use super::STARTER_CONFIG;

/// Write the starter configuration to `path`.
///
/// Refuses to overwrite an existing file unless `force` is set. Creates the
/// parent directory when missing and writes atomically so a failed write never
/// leaves a truncated config behind.
pub fn write_starter_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory at {}", parent.display()))?;
        }
    }

    let mut file = AtomicWriteFile::open(path)
        .with_context(|| format!("Failed to open atomic write file at {}", path.display()))?;
    file.write_all(STARTER_CONFIG.as_bytes())
        .context("Failed to write starter config")?;
    file.commit().context("Failed to save starter config")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_write_then_refuse_overwrite() {
        let dir = env::temp_dir().join("accountability_engine_init_test");
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("config.yaml");

        write_starter_config(&path, false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), STARTER_CONFIG);

        let err = write_starter_config(&path, false).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        write_starter_config(&path, true).unwrap();

        let _ = fs::remove_dir_all(&dir);
    }
}
