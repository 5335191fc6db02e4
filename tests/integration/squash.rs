//! Full pipeline runs over synthetic exports.

use super::common::{flatten, layer_id, ExportBuilder, Loaded, TestLayer};
use anyhow::Result;
use imgsquash::tree::{MemEntry, MemTree};
use imgsquash::{Notifier, SquashError, SquashOptions, Squasher};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn base() -> TestLayer {
    TestLayer::new(
        'a',
        None,
        "#(nop) ADD file:5d673d25da3a in /",
        MemTree::new()
            .file("etc/os-release", "ID=test")
            .file("var/cache/apt/pkgcache.bin", "cache")
            .file("tmp/build.log", "log")
            .file("opt/tool/bin", "v1")
            .symlink("bin", "usr/bin"),
    )
}

fn install() -> TestLayer {
    TestLayer::new(
        'b',
        Some('a'),
        "apt-get install -y curl",
        MemTree::new()
            .file("usr/bin/curl", "curl")
            .whiteout("var/cache/apt")
            .whiteout("opt/tool"),
    )
}

fn build() -> TestLayer {
    TestLayer::new(
        'c',
        Some('b'),
        "make install",
        MemTree::new()
            .file("usr/bin/curl", "curl 2")
            .whiteout("tmp/build.log")
            .opaque("etc")
            .file("etc/app.conf", "port=80")
            .file("opt/tool/new", "v2"),
    )
}

fn three_layers(dir: &Path) -> Result<ExportBuilder> {
    Ok(ExportBuilder::new(dir)?
        .layer(base())
        .layer(install())
        .layer(build())
        .tag("app", "latest", &layer_id('c')))
}

/// Paths directly inside `dir`.
fn entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        paths.push(entry?.path());
    }
    Ok(paths)
}

fn squash(options: &SquashOptions) -> Result<String, SquashError> {
    Squasher::new(Notifier::new(0)).squash(options)
}

fn options(input: &Path, output: &Path) -> SquashOptions {
    SquashOptions {
        input: Some(input.to_path_buf()),
        output: Some(output.to_path_buf()),
        ..Default::default()
    }
}

#[test]
fn test_full_squash_matches_layer_overlay() -> Result<()> {
    let temp = TempDir::new()?;
    let input = three_layers(temp.path())?.write_to(&temp.path().join("in.tar"))?;
    let output = temp.path().join("out.tar");

    let new_id = squash(&options(&input, &output))?;

    let loaded = Loaded::read(&output)?;
    assert_eq!(loaded.chain()?, vec![new_id.clone()]);

    let expected = flatten(vec![base().tree, install().tree, build().tree]);
    let merged = loaded.tree(&new_id)?;
    assert_eq!(merged, expected);
    assert_eq!(
        merged.paths(),
        vec![
            "bin",
            "etc",
            "etc/app.conf",
            "opt",
            "opt/tool",
            "opt/tool/new",
            "tmp",
            "usr",
            "usr/bin",
            "usr/bin/curl",
            "var",
            "var/cache",
        ]
    );
    assert_eq!(merged.get("usr/bin/curl"), Some(&MemEntry::File(b"curl 2".to_vec())));
    assert_eq!(merged.get("bin"), Some(&MemEntry::Symlink("usr/bin".into())));

    let config = loaded.config(&new_id)?;
    assert!(config.is_squash_marker());
    assert_eq!(config.parent_id(), None);
    assert_eq!(config.created, build().config.created);
    assert_eq!(loaded.export.repositories()["app"]["latest"], new_id);
    Ok(())
}

#[test]
fn test_squash_from_middle_keeps_ancestors_and_masks_them() -> Result<()> {
    let temp = TempDir::new()?;
    let input = three_layers(temp.path())?.write_to(&temp.path().join("in.tar"))?;
    let output = temp.path().join("out.tar");

    let new_id = squash(&SquashOptions {
        from: Some("bbbbbbbbbbbb".into()),
        ..options(&input, &output)
    })?;

    let loaded = Loaded::read(&output)?;
    assert_eq!(loaded.chain()?, vec![layer_id('a'), new_id.clone()]);
    assert_eq!(loaded.tree(&layer_id('a'))?, base().tree);
    assert_eq!(
        loaded.config(&new_id)?.command(),
        "/bin/sh -c #(squash) from aaaaaaaaaaaa"
    );

    // Markers survive so the base layer's deleted files stay deleted.
    let merged = loaded.tree(&new_id)?;
    assert!(merged.get("var/cache/.wh.apt").is_some());
    assert!(merged.get("tmp/.wh.build.log").is_some());
    assert!(merged.get("opt/tool/.wh..wh..opq").is_some());
    assert!(merged.get("opt/.wh.tool").is_none());

    let expected = flatten(vec![base().tree, install().tree, build().tree]);
    assert_eq!(loaded.flattened()?, expected);
    Ok(())
}

#[test]
fn test_squash_is_idempotent() -> Result<()> {
    let temp = TempDir::new()?;
    let input = three_layers(temp.path())?.write_to(&temp.path().join("in.tar"))?;
    let once = temp.path().join("once.tar");
    let twice = temp.path().join("twice.tar");

    let first = squash(&options(&input, &once))?;
    let second = squash(&options(&once, &twice))?;

    assert_eq!(first, second);
    assert_eq!(fs::read(&once)?, fs::read(&twice)?);
    Ok(())
}

#[test]
fn test_squash_is_deterministic() -> Result<()> {
    let temp = TempDir::new()?;
    let input = ExportBuilder::new(temp.path())?
        .layer(TestLayer::new(
            'a',
            None,
            "#(nop) ADD file:5d673d25da3a in /",
            MemTree::new()
                .file("etc/os-release", "ID=test")
                .file("tmp/build.log", "log"),
        ))
        .layer(install())
        .layer(build())
        .write_to(&temp.path().join("in.tar"))?;
    let first = temp.path().join("first.tar");
    let second = temp.path().join("second.tar");

    assert_eq!(
        squash(&options(&input, &first))?,
        squash(&options(&input, &second))?
    );
    assert_eq!(fs::read(&first)?, fs::read(&second)?);
    Ok(())
}

#[test]
fn test_previous_squash_marker_beats_from_marker() -> Result<()> {
    let temp = TempDir::new()?;
    let input = ExportBuilder::new(temp.path())?
        .layer(base())
        .layer(install())
        .layer(TestLayer::new(
            'c',
            Some('b'),
            "#(squash) from bbbbbbbbbbbb",
            MemTree::new().file("srv/app", "1"),
        ))
        .layer(TestLayer::new(
            'd',
            Some('c'),
            "echo more",
            MemTree::new().file("srv/extra", "2"),
        ))
        .write_to(&temp.path().join("in.tar"))?;
    let output = temp.path().join("out.tar");

    let new_id = squash(&options(&input, &output))?;

    let loaded = Loaded::read(&output)?;
    assert_eq!(
        loaded.chain()?,
        vec![layer_id('a'), layer_id('b'), new_id.clone()]
    );
    assert_eq!(loaded.tree(&new_id)?.paths(), vec!["srv", "srv/app", "srv/extra"]);
    Ok(())
}

#[test]
fn test_from_root_squashes_everything() -> Result<()> {
    let temp = TempDir::new()?;
    let input = ExportBuilder::new(temp.path())?
        .layer(TestLayer::new('a', None, "echo base", base().tree))
        .layer(TestLayer::new(
            'b',
            Some('a'),
            "#(nop) ADD file:app in /srv",
            MemTree::new().file("srv/app", "1"),
        ))
        .write_to(&temp.path().join("in.tar"))?;
    let output = temp.path().join("out.tar");

    // The FROM layer would be picked by default; `root` overrides it.
    let new_id = squash(&SquashOptions {
        from: Some("root".into()),
        ..options(&input, &output)
    })?;

    let loaded = Loaded::read(&output)?;
    assert_eq!(loaded.chain()?, vec![new_id.clone()]);
    assert!(loaded.tree(&new_id)?.get("srv/app").is_some());
    Ok(())
}

#[test]
fn test_multiple_images_rejected() -> Result<()> {
    let temp = TempDir::new()?;
    let input = three_layers(temp.path())?
        .tag("app", "old", &layer_id('b'))
        .write_to(&temp.path().join("in.tar"))?;
    let output = temp.path().join("out.tar");

    let err = squash(&options(&input, &output)).unwrap_err();
    assert!(matches!(err, SquashError::Format(_)), "{err}");
    assert!(err.to_string().contains("multiple images"));
    assert!(!output.exists());
    Ok(())
}

#[test]
fn test_branching_history_rejected() -> Result<()> {
    let temp = TempDir::new()?;
    let input = ExportBuilder::new(temp.path())?
        .layer(base())
        .layer(install())
        .layer(TestLayer::new(
            'c',
            Some('a'),
            "echo sibling",
            MemTree::new().file("sibling", "s"),
        ))
        .write_to(&temp.path().join("in.tar"))?;
    let output = temp.path().join("out.tar");

    let err = squash(&SquashOptions {
        from: Some("root".into()),
        ..options(&input, &output)
    })
    .unwrap_err();
    assert!(matches!(err, SquashError::Format(_)), "{err}");
    assert!(err.to_string().contains("branching"));
    Ok(())
}

#[test]
fn test_unknown_start_is_not_found() -> Result<()> {
    let temp = TempDir::new()?;
    let input = three_layers(temp.path())?.write_to(&temp.path().join("in.tar"))?;
    let output = temp.path().join("out.tar");

    let err = squash(&SquashOptions {
        from: Some("ffffffffffff".into()),
        ..options(&input, &output)
    })
    .unwrap_err();
    assert!(matches!(err, SquashError::NotFound(_)), "{err}");
    assert!(err.to_string().contains("ffffffffffff"));
    Ok(())
}

#[test]
fn test_missing_input_is_io_error() -> Result<()> {
    let temp = TempDir::new()?;
    let err = squash(&options(
        &temp.path().join("missing.tar"),
        &temp.path().join("out.tar"),
    ))
    .unwrap_err();
    assert!(matches!(err, SquashError::Io { .. }), "{err}");
    Ok(())
}

#[test]
fn test_gzip_input_is_accepted() -> Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let temp = TempDir::new()?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&three_layers(temp.path())?.build()?)?;
    let input = temp.path().join("in.tar.gz");
    fs::write(&input, encoder.finish()?)?;
    let output = temp.path().join("out.tar");

    let new_id = squash(&options(&input, &output))?;
    assert_eq!(Loaded::read(&output)?.chain()?, vec![new_id]);
    Ok(())
}

#[test]
fn test_working_directory_removed_after_success() -> Result<()> {
    let temp = TempDir::new()?;
    let scratch = TempDir::new()?;
    let input = three_layers(temp.path())?.write_to(&temp.path().join("in.tar"))?;

    squash(&SquashOptions {
        temp_dir: Some(scratch.path().to_path_buf()),
        ..options(&input, &temp.path().join("out.tar"))
    })?;

    assert!(entries(scratch.path())?.is_empty());
    Ok(())
}

#[test]
fn test_working_directory_removed_after_errors() -> Result<()> {
    let temp = TempDir::new()?;
    let scratch = TempDir::new()?;
    let input = three_layers(temp.path())?.write_to(&temp.path().join("in.tar"))?;
    let multi = three_layers(temp.path())?
        .tag("app", "old", &layer_id('b'))
        .write_to(&temp.path().join("multi.tar"))?;
    let output = temp.path().join("out.tar");

    let runs = [
        options(&multi, &output),
        SquashOptions {
            from: Some("ffffffffffff".into()),
            ..options(&input, &output)
        },
        options(&temp.path().join("missing.tar"), &output),
    ];
    let mut errors = Vec::new();
    for run in runs {
        let err = squash(&SquashOptions {
            temp_dir: Some(scratch.path().to_path_buf()),
            ..run
        })
        .unwrap_err();
        assert!(entries(scratch.path())?.is_empty(), "left behind after {err}");
        errors.push(err);
    }
    assert!(matches!(errors[0], SquashError::Format(_)));
    assert!(matches!(errors[1], SquashError::NotFound(_)));
    assert!(matches!(errors[2], SquashError::Io { .. }));
    Ok(())
}

#[test]
fn test_multiple_images_rejected_before_extraction() -> Result<()> {
    let temp = TempDir::new()?;
    let scratch = TempDir::new()?;
    let input = three_layers(temp.path())?
        .tag("app", "old", &layer_id('b'))
        .write_to(&temp.path().join("in.tar"))?;

    let err = squash(&SquashOptions {
        keep_temp: true,
        temp_dir: Some(scratch.path().to_path_buf()),
        ..options(&input, &temp.path().join("out.tar"))
    })
    .unwrap_err();
    assert!(matches!(err, SquashError::Format(_)), "{err}");

    let workdirs = entries(scratch.path())?;
    assert_eq!(workdirs.len(), 1);
    for c in ['a', 'b', 'c'] {
        let layer_dir = workdirs[0].join(layer_id(c));
        assert!(layer_dir.join("layer.tar").is_file());
        assert!(!layer_dir.join("layer").exists());
    }
    Ok(())
}

#[test]
fn test_keep_temp_leaves_merged_layer_expanded() -> Result<()> {
    let temp = TempDir::new()?;
    let scratch = TempDir::new()?;
    let input = three_layers(temp.path())?.write_to(&temp.path().join("in.tar"))?;

    let new_id = squash(&SquashOptions {
        from: Some("bbbbbbbbbbbb".into()),
        keep_temp: true,
        temp_dir: Some(scratch.path().to_path_buf()),
        ..options(&input, &temp.path().join("out.tar"))
    })?;

    let workdirs = entries(scratch.path())?;
    assert_eq!(workdirs.len(), 1);
    let workdir = &workdirs[0];
    assert!(workdir.join(&new_id).join("layer/usr/bin/curl").is_file());
    assert!(workdir.join(layer_id('a')).join("layer.tar").is_file());
    assert!(!workdir.join(layer_id('a')).join("layer").exists());
    Ok(())
}
