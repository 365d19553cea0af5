use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default ceiling for the in-memory build context.
pub const DEFAULT_CONTEXT_LIMIT: u64 = 512 * 1024 * 1024;

/// Name of the generated Dockerfile at the root of the archive.
pub const DOCKERFILE_NAME: &str = "Dockerfile";

const EXCLUDED: [&str; 1] = [".git"];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("build context exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Packs `root` (minus version-control metadata) plus `dockerfile` into a tar
/// archive held in memory. Fails once the file payload passes `limit` bytes.
pub fn build_context(root: &Path, dockerfile: &str, limit: u64) -> Result<Vec<u8>, ArchiveError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let mut total = dockerfile.len() as u64;
    if total > limit {
        return Err(ArchiveError::TooLarge { limit });
    }
    append_tree(&mut builder, root, Path::new(""), &mut total, limit)?;

    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, DOCKERFILE_NAME, dockerfile.as_bytes())
        .map_err(io_err(root))?;

    builder.into_inner().map_err(io_err(root))
}

fn append_tree(
    builder: &mut tar::Builder<Vec<u8>>,
    dir: &Path,
    relative: &Path,
    total: &mut u64,
    limit: u64,
) -> Result<(), ArchiveError> {
    let mut entries = fs::read_dir(dir)
        .map_err(io_err(dir))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err(dir))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if EXCLUDED.iter().any(|ex| name == *ex) {
            continue;
        }
        // the generated Dockerfile takes this slot
        if relative.as_os_str().is_empty() && name == DOCKERFILE_NAME {
            continue;
        }

        let path = entry.path();
        let archived = relative.join(&name);
        let file_type = entry.file_type().map_err(io_err(&path))?;

        if file_type.is_dir() {
            builder
                .append_dir(&archived, &path)
                .map_err(io_err(&path))?;
            append_tree(builder, &path, &archived, total, limit)?;
        } else {
            if file_type.is_file() {
                *total += entry.metadata().map_err(io_err(&path))?.len();
                if *total > limit {
                    return Err(ArchiveError::TooLarge { limit });
                }
            }
            builder
                .append_path_with_name(&path, &archived)
                .map_err(io_err(&path))?;
        }
    }

    Ok(())
}
