// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Build system detection and per-stage command selection.
//!
//! Default commands reference the environment the pipeline exports
//! (`$PREFIX`, `$JOBS`, `$DESTDIR`), so recipe overrides compose with
//! the same variables.

use std::path::Path;

use metafile::BuildSystem;

/// Resolve `auto` by inspecting the unpacked source tree
pub fn detect(src_dir: &Path) -> BuildSystem {
    let present = |name: &str| src_dir.join(name).exists();

    if present("configure") {
        BuildSystem::Autotools
    } else if present("CMakeLists.txt") {
        BuildSystem::Cmake
    } else if present("meson.build") {
        BuildSystem::Meson
    } else if present("Cargo.toml") {
        BuildSystem::Cargo
    } else if present("package.json") {
        BuildSystem::Node
    } else if present("pyproject.toml") || present("setup.py") {
        BuildSystem::Python
    } else {
        BuildSystem::Make
    }
}

/// The four stage commands in force for one build, recipe overrides
/// applied over the build system defaults
#[derive(Debug, Clone, Default)]
pub struct Commands {
    pub configure: Option<String>,
    pub build: Option<String>,
    pub check: Option<String>,
    pub install: Option<String>,
}

pub fn commands(build: &metafile::Build, system: BuildSystem) -> Commands {
    let defaults = defaults(system);

    Commands {
        configure: build.configure.clone().or(defaults.configure),
        build: build.build.clone().or(defaults.build),
        check: build.check.clone().or(defaults.check),
        install: build.install.clone().or(defaults.install),
    }
}

fn defaults(system: BuildSystem) -> Commands {
    let owned = |s: &str| Some(s.to_owned());

    match system {
        BuildSystem::Autotools => Commands {
            configure: owned(r#"./configure --prefix="$PREFIX""#),
            build: owned(r#"make -j"$JOBS""#),
            check: owned("make -k check"),
            install: owned(r#"make DESTDIR="$DESTDIR" install"#),
        },
        BuildSystem::Cmake => Commands {
            configure: owned(
                r#"cmake -S . -B build -DCMAKE_BUILD_TYPE=Release -DCMAKE_INSTALL_PREFIX="$PREFIX""#,
            ),
            build: owned(r#"cmake --build build -j "$JOBS""#),
            check: owned("ctest --test-dir build --output-on-failure"),
            install: owned(r#"DESTDIR="$DESTDIR" cmake --install build"#),
        },
        BuildSystem::Meson => Commands {
            configure: owned(r#"meson setup build --prefix="$PREFIX""#),
            build: owned(r#"meson compile -C build -j "$JOBS""#),
            check: owned("meson test -C build"),
            install: owned(r#"DESTDIR="$DESTDIR" meson install -C build"#),
        },
        BuildSystem::Make => Commands {
            configure: None,
            build: owned(r#"make -j"$JOBS""#),
            check: owned("make -k check"),
            install: owned(r#"make DESTDIR="$DESTDIR" install"#),
        },
        BuildSystem::Cargo => Commands {
            configure: None,
            build: owned(r#"cargo build --release --jobs "$JOBS""#),
            check: owned(r#"cargo test --release --jobs "$JOBS""#),
            install: owned(r#"cargo install --path . --root "$DESTDIR$PREFIX" --no-track"#),
        },
        BuildSystem::Node => Commands {
            configure: None,
            build: owned("npm install --no-audit --no-fund"),
            check: owned("npm test"),
            install: owned(r#"npm install --global --prefix "$DESTDIR$PREFIX" ."#),
        },
        BuildSystem::Python => Commands {
            configure: None,
            build: owned("python3 -m build --wheel --no-isolation"),
            check: None,
            install: owned(r#"python3 -m installer --destdir="$DESTDIR" dist/*.whl"#),
        },
        BuildSystem::Auto | BuildSystem::Custom => Commands::default(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fs_err as fs;

    #[test]
    fn detection_prefers_configure() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("configure"), "#!/bin/sh\n").unwrap();
        fs::write(dir.path().join("CMakeLists.txt"), "").unwrap();

        assert_eq!(detect(dir.path()), BuildSystem::Autotools);
    }

    #[test]
    fn detection_falls_back_to_make() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Makefile"), "all:\n").unwrap();

        assert_eq!(detect(dir.path()), BuildSystem::Make);
    }

    #[test]
    fn recipe_overrides_win() {
        let build = metafile::Build {
            configure: Some("./bootstrap && ./configure".to_owned()),
            ..Default::default()
        };

        let commands = commands(&build, BuildSystem::Autotools);
        assert_eq!(
            commands.configure.as_deref(),
            Some("./bootstrap && ./configure")
        );
        // defaults untouched elsewhere
        assert_eq!(commands.build.as_deref(), Some(r#"make -j"$JOBS""#));
    }

    #[test]
    fn custom_provides_nothing() {
        let commands = commands(&metafile::Build::default(), BuildSystem::Custom);
        assert!(commands.configure.is_none());
        assert!(commands.build.is_none());
        assert!(commands.install.is_none());
    }
}
