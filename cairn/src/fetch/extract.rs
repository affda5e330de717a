// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Suffix-dispatched archive extraction with path traversal protection.
//!
//! Tarballs and gzip ride the in-process codecs; zip and bzip2 are
//! delegated to the system tools, surfacing `NoTool` when absent.

use std::{
    io,
    io::Read,
    path::{Component, Path, PathBuf},
};

use fs_err as fs;
use fs_err::File;

use super::Error;
use crate::util;

/// Extract `archive` into `dest_dir`, choosing the extractor by suffix
pub fn extract(archive: &Path, dest_dir: &Path) -> Result<(), Error> {
    util::ensure_dir_exists(dest_dir)?;

    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_lowercase();

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let reader = flate2::read::GzDecoder::new(File::open(archive)?);
        unpack_tar(reader, dest_dir)
    } else if name.ends_with(".tar.xz") {
        let reader = xz2::read::XzDecoder::new(File::open(archive)?);
        unpack_tar(reader, dest_dir)
    } else if name.ends_with(".tar.zst") {
        let reader = zstd::stream::read::Decoder::new(File::open(archive)?)?;
        unpack_tar(reader, dest_dir)
    } else if name.ends_with(".tar.bz2") {
        run_tool(
            "tar",
            &[
                "xjf",
                &archive.display().to_string(),
                "-C",
                &dest_dir.display().to_string(),
            ],
        )
    } else if name.ends_with(".tar") {
        unpack_tar(File::open(archive)?, dest_dir)
    } else if name.ends_with(".zip") {
        extract_zip(archive, dest_dir)
    } else if name.ends_with(".gz") {
        // Lone gzipped file: decode beside the archive name sans suffix
        let stem = name.trim_end_matches(".gz");
        let mut decoder = flate2::read::GzDecoder::new(File::open(archive)?);
        let mut out = File::create(dest_dir.join(stem))?;
        io::copy(&mut decoder, &mut out)?;
        Ok(())
    } else {
        Err(Error::UnsupportedArchive(archive.to_path_buf()))
    }
}

fn unpack_tar(reader: impl Read, dest_dir: &Path) -> Result<(), Error> {
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);

    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if !safe_path(&path) {
            return Err(Error::UnsafePath(path));
        }

        entry.unpack_in(dest_dir)?;
    }

    Ok(())
}

/// Reject absolute entries and anything that climbs out after
/// normalization
fn safe_path(path: &Path) -> bool {
    let mut depth: i32 = 0;

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return false,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
        }
    }

    true
}

fn extract_zip(archive: &Path, dest_dir: &Path) -> Result<(), Error> {
    // Validate the listing before letting unzip loose
    let listing = std::process::Command::new("unzip")
        .args(["-Z1", &archive.display().to_string()])
        .output()
        .map_err(tool_error("unzip"))?;

    if !listing.status.success() {
        return Err(Error::CorruptArchive(archive.to_path_buf()));
    }

    for line in String::from_utf8_lossy(&listing.stdout).lines() {
        let path = PathBuf::from(line);
        if !safe_path(&path) {
            return Err(Error::UnsafePath(path));
        }
    }

    run_tool(
        "unzip",
        &[
            "-qo",
            &archive.display().to_string(),
            "-d",
            &dest_dir.display().to_string(),
        ],
    )
}

fn run_tool(tool: &str, args: &[&str]) -> Result<(), Error> {
    let status = std::process::Command::new(tool)
        .args(args)
        .status()
        .map_err(tool_error(tool))?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::CorruptArchive(PathBuf::from(
            args.iter()
                .find(|a| a.contains('.'))
                .copied()
                .unwrap_or_default(),
        )))
    }
}

fn tool_error(tool: &str) -> impl Fn(io::Error) -> Error + '_ {
    move |e| match e.kind() {
        io::ErrorKind::NotFound => Error::NoTool(tool.to_owned()),
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_tar_gz(dir: &Path, files: &[(&str, &str)]) -> PathBuf {
        let archive = dir.join("fixture.tar.gz");
        let gz = flate2::write::GzEncoder::new(
            File::create(&archive).unwrap(),
            flate2::Compression::default(),
        );
        let mut tar = tar::Builder::new(gz);

        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }

        tar.into_inner().unwrap().finish().unwrap();
        archive
    }

    #[test]
    fn tarball_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = make_tar_gz(
            dir.path(),
            &[
                ("pkg-1.0/configure", "#!/bin/sh\n"),
                ("pkg-1.0/src/main.c", "int main(void) { return 0; }\n"),
            ],
        );

        let dest = dir.path().join("out");
        extract(&archive, &dest).unwrap();

        assert!(dest.join("pkg-1.0/configure").is_file());
        assert_eq!(
            fs::read_to_string(dest.join("pkg-1.0/src/main.c")).unwrap(),
            "int main(void) { return 0; }\n"
        );
    }

    #[test]
    fn lone_gzip_decodes_to_stem() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("notes.txt.gz");

        let mut gz = flate2::write::GzEncoder::new(
            File::create(&archive).unwrap(),
            flate2::Compression::default(),
        );
        io::Write::write_all(&mut gz, b"remember the milk").unwrap();
        gz.finish().unwrap();

        let dest = dir.path().join("out");
        extract(&archive, &dest).unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("notes.txt")).unwrap(),
            "remember the milk"
        );
    }

    #[test]
    fn traversal_paths_rejected() {
        assert!(safe_path(Path::new("pkg/src/main.c")));
        assert!(safe_path(Path::new("./pkg/./src")));
        assert!(safe_path(Path::new("pkg/../pkg2/file")));

        assert!(!safe_path(Path::new("/etc/passwd")));
        assert!(!safe_path(Path::new("../outside")));
        assert!(!safe_path(Path::new("pkg/../../outside")));
    }

    #[test]
    fn unknown_suffix_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("mystery.rar");
        fs::write(&archive, b"???").unwrap();

        assert!(matches!(
            extract(&archive, &dir.path().join("out")),
            Err(Error::UnsupportedArchive(_))
        ));
    }
}
