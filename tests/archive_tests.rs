//! Tests for `image save` / `image load` archives.

mod common;

use cask::archive::{export, import};
use cask::oci::ArchiveManifestEntry;
use cask::{Error, ImageReference, ImageStore, LayerCache, Policy};
use common::{LayerBuilder, add_image, image_config, two_layers};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::{Builder, Header};
use tempfile::TempDir;

fn store_at(dir: &Path) -> ImageStore {
    ImageStore::open(dir.join("repo"), Policy::default()).unwrap()
}

fn reference(name: &str) -> ImageReference {
    ImageReference::parse(name).unwrap()
}

fn save(store: &ImageStore, names: &[&str], path: &Path) {
    let references: Vec<_> = names.iter().map(|n| reference(n)).collect();
    export(store, &references, File::create(path).unwrap()).unwrap();
}

fn append(builder: &mut Builder<Vec<u8>>, name: &str, data: &[u8]) {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, name, data).unwrap();
}

/// A `docker save` style archive with no OCI layout and no tags.
fn docker_archive(path: &Path, layers: &[Vec<u8>], cmd: &[&str]) {
    let mut builder = Builder::new(Vec::new());
    let config = serde_json::to_vec(&image_config(&[], cmd)).unwrap();
    append(&mut builder, "config.json", &config);

    let mut names = Vec::new();
    for (i, layer) in layers.iter().enumerate() {
        let name = format!("layer{i}/layer.tar");
        append(&mut builder, &name, layer);
        names.push(name);
    }
    let records = vec![ArchiveManifestEntry {
        config: "config.json".to_string(),
        repo_tags: Vec::new(),
        layers: names,
    }];
    append(
        &mut builder,
        "manifest.json",
        &serde_json::to_vec(&records).unwrap(),
    );
    fs::write(path, builder.into_inner().unwrap()).unwrap();
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_save_and_load_keeps_digest_and_name() {
    let source_dir = TempDir::new().unwrap();
    let source = store_at(source_dir.path());
    let image = add_image(&source, "docker.io/library/app:v1", &two_layers(), &["sh"]);

    let archive = source_dir.path().join("app.tar");
    save(&source, &["app:v1"], &archive);

    let target_dir = TempDir::new().unwrap();
    let target = store_at(target_dir.path());
    let (name, loaded) = import(&target, &archive, None, target_dir.path()).unwrap();

    assert_eq!(name, "docker.io/library/app:v1");
    assert_eq!(loaded.digest, image.digest);
    assert_eq!(loaded.config, image.config);
    for layer in loaded.layers() {
        assert!(target.blobs().has_blob(&layer.digest));
    }
    assert_eq!(target.find(&reference("app:v1")).unwrap().digest, image.digest);
}

#[test]
fn test_loaded_image_materializes() {
    let source_dir = TempDir::new().unwrap();
    let source = store_at(source_dir.path());
    add_image(&source, "docker.io/library/app:v1", &two_layers(), &["sh"]);
    let archive = source_dir.path().join("app.tar");
    save(&source, &["app:v1"], &archive);

    let target_dir = TempDir::new().unwrap();
    let target = store_at(target_dir.path());
    let (_, loaded) = import(&target, &archive, None, target_dir.path()).unwrap();

    let cache = LayerCache::new(
        target_dir.path().join("lower"),
        target_dir.path().join("tmp"),
        target.blobs().clone(),
    )
    .unwrap();
    let root = cache.materialize(&loaded).unwrap();
    assert_eq!(
        fs::read_to_string(root.join("etc/motd")).unwrap(),
        "upper motd\n"
    );
}

#[test]
fn test_archive_contains_both_layouts() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_at(temp_dir.path());
    let image = add_image(&store, "docker.io/library/app:v1", &two_layers(), &["sh"]);
    let archive = temp_dir.path().join("app.tar");
    save(&store, &["app:v1"], &archive);

    let mut names: Vec<PathBuf> = tar::Archive::new(File::open(&archive).unwrap())
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().into_owned())
        .collect();
    names.sort();

    assert!(names.contains(&PathBuf::from("oci-layout")));
    assert!(names.contains(&PathBuf::from("index.json")));
    assert!(names.contains(&PathBuf::from("manifest.json")));
    assert!(names.contains(&PathBuf::from(format!("blobs/sha256/{}", image.hex()))));
}

#[test]
fn test_save_unknown_image_fails() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_at(temp_dir.path());
    let result = export(&store, &[reference("ghost")], Vec::new());
    assert!(matches!(result, Err(Error::ImageNotFound(_))));
}

// =============================================================================
// Naming Tests
// =============================================================================

#[test]
fn test_load_with_explicit_tag() {
    let source_dir = TempDir::new().unwrap();
    let source = store_at(source_dir.path());
    let image = add_image(&source, "docker.io/library/app:v1", &two_layers(), &["sh"]);
    let archive = source_dir.path().join("app.tar");
    save(&source, &["app:v1"], &archive);

    let target_dir = TempDir::new().unwrap();
    let target = store_at(target_dir.path());
    let tag = reference("registry.local/team/app:imported");
    let (name, _) = import(&target, &archive, Some(&tag), target_dir.path()).unwrap();

    assert_eq!(name, "registry.local/team/app:imported");
    assert_eq!(target.find(&tag).unwrap().digest, image.digest);
    assert!(target.find(&reference("app:v1")).is_err());
}

#[test]
fn test_load_docker_archive_named_after_file() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_at(temp_dir.path());
    let archive = temp_dir.path().join("toolbox.tar");
    docker_archive(&archive, &two_layers(), &["/bin/tool"]);

    let (name, image) = import(&store, &archive, None, temp_dir.path()).unwrap();

    assert_eq!(name, "docker.io/library/toolbox:latest");
    assert_eq!(image.layers().len(), 2);
    assert_eq!(
        image.config.container_config().cmd,
        Some(vec!["/bin/tool".to_string()])
    );
    // Staging directories are cleaned up.
    let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers.len(), 2, "{leftovers:?}");
}

#[test]
fn test_load_gzip_archive() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_at(temp_dir.path());

    let plain = temp_dir.path().join("plain.tar");
    docker_archive(
        &plain,
        &[LayerBuilder::new().file("hello", "world").gzip()],
        &["hello"],
    );
    let archive = temp_dir.path().join("compressed.tgz");
    let mut encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
    std::io::copy(&mut File::open(&plain).unwrap(), &mut encoder).unwrap();
    encoder.finish().unwrap();

    let (name, image) = import(&store, &archive, None, temp_dir.path()).unwrap();
    assert_eq!(name, "docker.io/library/compressed:latest");
    assert_eq!(
        image.layers()[0].media_type,
        cask::constants::DOCKER_LAYER_MEDIA_TYPE_GZIP
    );
}

#[test]
fn test_load_rejects_unrecognized_archive() {
    let temp_dir = TempDir::new().unwrap();
    let store = store_at(temp_dir.path());
    let archive = temp_dir.path().join("junk.tar");
    fs::write(&archive, LayerBuilder::new().file("readme", "hi").tar()).unwrap();

    let result = import(&store, &archive, None, temp_dir.path());
    assert!(matches!(result, Err(Error::InvalidArchive { .. })));
}
