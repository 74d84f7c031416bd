use std::fs::File;
use std::io::{self, BufRead, BufReader, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Local;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

// Model weights are re-downloadable and stay out of backups.
const DATA_FILES: &[&str] = &["items.csv", "config.yaml", "vectors.bin"];

pub fn create_backup(output_path: Option<PathBuf>, base_path: &Path) -> Result<()> {
    let present: Vec<(PathBuf, &str)> = DATA_FILES
        .iter()
        .map(|name| (base_path.join(name), *name))
        .filter(|(path, _)| path.exists())
        .collect();
    if present.is_empty() {
        bail!("No files found to backup in {}", base_path.display());
    }

    // With no output path and a piped stdout, the archive goes to stdout
    // and progress moves to stderr.
    let destination = match output_path {
        Some(p) => Some(p),
        None if io::stdout().is_terminal() => Some(default_archive_name()),
        None => None,
    };
    let to_stdout = destination.is_none();
    let say = |line: String| {
        if to_stdout {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    };

    let sink: Box<dyn Write> = match &destination {
        Some(path) => Box::new(
            File::create(path)
                .with_context(|| format!("Failed to create archive at {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };

    let mut tarball = Builder::new(GzEncoder::new(sink, Compression::default()));
    for (path, name) in &present {
        tarball
            .append_path_with_name(path, name)
            .with_context(|| format!("Failed to add {name} to archive"))?;
        say(format!("  + {name}"));
    }
    tarball
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize gzip stream")?;

    if let Some(path) = &destination {
        let size_kb = std::fs::metadata(path)?.len() / 1024;
        say(format!(
            "\nBackup created: {} ({} KB)",
            path.display(),
            size_kb
        ));
    }

    Ok(())
}

fn default_archive_name() -> PathBuf {
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    PathBuf::from(format!("mnemo-backup-{stamp}.tar.gz"))
}

pub fn import_backup(archive: Option<&Path>, assume_yes: bool, base_path: &Path) -> Result<()> {
    let (archive_path, _spool) = resolve_archive(archive)?;

    let restorable = scan_archive(&archive_path)?;
    if restorable.is_empty() {
        bail!(
            "Archive does not contain any recognized backup files.\n\
             Expected one of: {DATA_FILES:?}"
        );
    }

    println!("Found {} files to import:", restorable.len());
    for name in &restorable {
        println!("  {name}");
    }
    println!("\nDestination: {}", base_path.display());

    if !assume_yes && !confirm_overwrite()? {
        println!("Import cancelled.");
        return Ok(());
    }

    let restored = unpack_archive(&archive_path, base_path)?;
    println!("\nImported {restored} files to {}", base_path.display());

    Ok(())
}

// Stdin input is spooled to a temp file so the archive can be read twice.
// The returned guard keeps the temp file alive until the import is done.
fn resolve_archive(path: Option<&Path>) -> Result<(PathBuf, Option<tempfile::NamedTempFile>)> {
    match path {
        Some(p) => Ok((p.to_path_buf(), None)),
        None if !io::stdin().is_terminal() => {
            let mut spool =
                tempfile::NamedTempFile::new().context("Failed to create temp file for stdin")?;
            io::copy(&mut io::stdin().lock(), &mut spool)
                .context("Failed to read archive from stdin")?;
            let path = spool.path().to_path_buf();
            Ok((path, Some(spool)))
        }
        None => bail!("No archive path provided. Pipe an archive to stdin or pass a path."),
    }
}

fn open_archive(path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open archive at {}", path.display()))?;
    Ok(Archive::new(GzDecoder::new(file)))
}

// First pass only lists entries; nothing is written yet.
fn scan_archive(path: &Path) -> Result<Vec<String>> {
    let mut archive = open_archive(path)?;
    let mut found = Vec::new();
    for entry in archive.entries().context("Failed to read archive entries")? {
        let entry = entry.context("Failed to read archive entry")?;
        let name = entry
            .path()
            .context("Failed to get entry path")?
            .to_string_lossy()
            .into_owned();
        if is_restorable(&name) {
            found.push(name);
        }
    }
    Ok(found)
}

fn confirm_overwrite() -> Result<bool> {
    println!("\nThis will overwrite existing files. Continue? [y/N] ");
    let mut line = String::new();
    BufReader::new(io::stdin().lock())
        .read_line(&mut line)
        .context("Failed to read user input")?;
    let reply = line.trim().to_lowercase();
    Ok(reply == "y" || reply == "yes")
}

fn unpack_archive(path: &Path, base_path: &Path) -> Result<usize> {
    std::fs::create_dir_all(base_path)
        .with_context(|| format!("Failed to create directory {}", base_path.display()))?;

    let mut archive = open_archive(path)?;
    let mut restored = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if !is_restorable(&name) {
            continue;
        }
        entry
            .unpack(base_path.join(&name))
            .with_context(|| format!("Failed to extract {name}"))?;
        println!("  + {name}");
        restored += 1;
    }
    Ok(restored)
}

// Only exact data file names come back out of an archive. Anything
// else, including paths that merely start with a known name, is ignored.
fn is_restorable(name: &str) -> bool {
    DATA_FILES.contains(&name)
}
