use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use flate2::read::GzDecoder;
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::model::package::{PACKAGE_FILE, PackageConfig};
use crate::model::project::{is_local_source, parse_constraint};

/// A package unpacked into a scratch directory.
#[derive(Debug, Clone)]
pub struct FetchedPackage {
    /// Directory holding `package.toml`.
    pub root: PathBuf,
    /// Where the package came from, recorded in the lock.
    pub resolved: String,
    /// `sha256-<hex>` content hash.
    pub integrity: String,
}

/// A place packages are resolved and fetched from.
pub trait Registry {
    fn describe(&self) -> String;

    /// Every version the registry offers for `name`, in no particular order.
    fn versions(&self, name: &str) -> Result<Vec<String>>;

    /// Places the package into `dest`, which exists and is empty.
    fn fetch(&self, name: &str, version: &str, dest: &Path) -> Result<FetchedPackage>;

    /// Highest offered version matching `constraint` (any version when `None`).
    fn resolve(&self, name: &str, constraint: Option<&str>) -> Result<String> {
        let requirement = parse_constraint(constraint.unwrap_or("*"))?;
        let mut candidates: Vec<semver::Version> = self
            .versions(name)?
            .iter()
            .filter_map(|raw| match semver::Version::parse(raw) {
                Ok(version) => Some(version),
                Err(err) => {
                    debug!("ignoring version `{raw}` of {name}: {err}");
                    None
                }
            })
            .filter(|version| requirement.matches(version))
            .collect();
        candidates.sort();

        candidates.pop().map(|v| v.to_string()).ok_or_else(|| {
            anyhow!(
                "no version of `{name}` matching `{}` in {}",
                constraint.unwrap_or("*"),
                self.describe()
            )
        })
    }
}

/// Directory registry: `<root>/<name>/<version>/package.toml` or
/// `<root>/<name>/<name>-<version>.tar.gz`.
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    root: PathBuf,
}

impl LocalRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn archive_path(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(name).join(format!("{name}-{version}.tar.gz"))
    }
}

impl Registry for LocalRegistry {
    fn describe(&self) -> String {
        format!("registry {}", self.root.display())
    }

    fn versions(&self, name: &str) -> Result<Vec<String>> {
        let dir = self.root.join(name);
        if !dir.is_dir() {
            bail!("plugin `{name}` not found in {}", self.describe());
        }

        let prefix = format!("{name}-");
        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();

            if path.is_dir() && path.join(PACKAGE_FILE).is_file() {
                versions.push(file_name);
            } else if let Some(version) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".tar.gz"))
            {
                versions.push(version.to_string());
            }
        }

        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    fn fetch(&self, name: &str, version: &str, dest: &Path) -> Result<FetchedPackage> {
        let unpacked = self.root.join(name).join(version);
        if unpacked.join(PACKAGE_FILE).is_file() {
            copy_tree(&unpacked, dest)?;
            return Ok(FetchedPackage {
                root: dest.to_path_buf(),
                resolved: format!("file://{}", unpacked.display()),
                integrity: hash_tree(&unpacked)?,
            });
        }

        let archive = self.archive_path(name, version);
        if !archive.is_file() {
            bail!("{name}@{version} not found in {}", self.describe());
        }

        let mut bytes = Vec::new();
        fs::File::open(&archive)
            .and_then(|mut file| file.read_to_end(&mut bytes))
            .with_context(|| format!("reading {}", archive.display()))?;

        tar::Archive::new(GzDecoder::new(bytes.as_slice()))
            .unpack(dest)
            .with_context(|| format!("unpacking {}", archive.display()))?;

        Ok(FetchedPackage {
            root: package_root(dest)?,
            resolved: format!("file://{}", archive.display()),
            integrity: format!("sha256-{:x}", Sha256::digest(&bytes)),
        })
    }
}

/// A single package directory named directly by a `file:` source.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    path: PathBuf,
}

impl DirectorySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Registry for DirectorySource {
    fn describe(&self) -> String {
        format!("source {}", self.path.display())
    }

    fn versions(&self, name: &str) -> Result<Vec<String>> {
        let package = PackageConfig::load(&self.path)?;
        if package.name() != name {
            bail!(
                "{} holds package `{}`, not `{name}`",
                self.describe(),
                package.name()
            );
        }
        Ok(vec![package.version().to_string()])
    }

    fn fetch(&self, name: &str, version: &str, dest: &Path) -> Result<FetchedPackage> {
        let offered = self.versions(name)?;
        if !offered.iter().any(|v| v == version) {
            bail!("{} offers {name}@{}, not {version}", self.describe(), offered.join(", "));
        }

        copy_tree(&self.path, dest)?;
        Ok(FetchedPackage {
            root: dest.to_path_buf(),
            resolved: format!("file:{}", self.path.display()),
            integrity: hash_tree(&self.path)?,
        })
    }
}

/// Opens a plugin's `source` string. Relative paths resolve against `base`.
pub fn open_source(source: &str, base: &Path) -> Result<Box<dyn Registry>> {
    let raw = source.strip_prefix("file://").or_else(|| source.strip_prefix("file:"));
    let path = match raw {
        Some(path) => path,
        None if !is_local_source(source) => {
            bail!("unsupported plugin source `{source}`: only local `file:` sources are available")
        }
        None => source,
    };

    let path = Path::new(path);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    Ok(Box::new(DirectorySource::new(path)))
}

/// Opens a registry given by path or `file://` URL.
pub fn open_registry(path: Option<&str>, url: Option<&str>, base: &Path) -> Result<Box<dyn Registry>> {
    let location = match (path, url) {
        (Some(path), _) => path,
        (None, Some(url)) => url.strip_prefix("file://").ok_or_else(|| {
            anyhow!("unsupported registry url `{url}`: only local registries are available")
        })?,
        (None, None) => bail!("registry has neither `path` nor `url`"),
    };

    let root = Path::new(location);
    let root = if root.is_absolute() {
        root.to_path_buf()
    } else {
        base.join(root)
    };
    Ok(Box::new(LocalRegistry::new(root)))
}

pub(crate) fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkBuilder::new(root)
        .standard_filters(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build()
    {
        let entry = entry?;
        if entry.file_type().is_some_and(|kind| kind.is_file()) {
            files.push(entry.path().strip_prefix(root)?.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for relative in walk_files(src)? {
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src.join(&relative), &target)
            .with_context(|| format!("copying {}", relative.display()))?;
    }
    Ok(())
}

/// Hash over every file's relative path and bytes, in path order.
fn hash_tree(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for relative in walk_files(root)? {
        hasher.update(relative.to_string_lossy().replace('\\', "/").as_bytes());
        hasher.update([0u8]);
        hasher.update(fs::read(root.join(&relative))?);
        hasher.update([0u8]);
    }
    Ok(format!("sha256-{:x}", hasher.finalize()))
}

/// Archives may wrap the package in one top-level directory.
fn package_root(dest: &Path) -> Result<PathBuf> {
    if dest.join(PACKAGE_FILE).is_file() {
        return Ok(dest.to_path_buf());
    }

    let mut dirs = fs::read_dir(dest)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir());
    match (dirs.next(), dirs.next()) {
        (Some(dir), None) if dir.join(PACKAGE_FILE).is_file() => Ok(dir),
        _ => bail!("archive does not contain a {PACKAGE_FILE}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    fn write_package(dir: &Path, name: &str, version: &str) {
        fs::create_dir_all(dir.join("commands")).unwrap();
        fs::write(
            dir.join(PACKAGE_FILE),
            format!("[package]\nname = \"{name}\"\nversion = \"{version}\"\n"),
        )
        .unwrap();
        fs::write(dir.join("commands/hello.md"), "say hello").unwrap();
    }

    fn write_archive(registry: &Path, name: &str, version: &str) {
        let staging = TempDir::new().unwrap();
        let wrapped = staging.path().join("package");
        write_package(&wrapped, name, version);

        let dir = registry.join(name);
        fs::create_dir_all(&dir).unwrap();
        let file = fs::File::create(dir.join(format!("{name}-{version}.tar.gz"))).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.append_dir_all("package", &wrapped).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn resolves_highest_matching_version() {
        let registry_dir = TempDir::new().unwrap();
        for version in ["1.0.0", "1.4.2", "2.0.0"] {
            write_package(&registry_dir.path().join("p").join(version), "p", version);
        }
        write_package(&registry_dir.path().join("p/not-a-version"), "p", "0.0.0");

        let registry = LocalRegistry::new(registry_dir.path());
        assert_eq!(registry.resolve("p", None).unwrap(), "2.0.0");
        assert_eq!(registry.resolve("p", Some("^1.0")).unwrap(), "1.4.2");
        assert_eq!(registry.resolve("p", Some("=1.0.0")).unwrap(), "1.0.0");
        assert!(registry.resolve("p", Some("^3")).is_err());
        assert!(registry.resolve("missing", None).is_err());
    }

    #[test]
    fn fetches_directory_package_with_stable_integrity() {
        let registry_dir = TempDir::new().unwrap();
        write_package(&registry_dir.path().join("p/1.0.0"), "p", "1.0.0");
        let registry = LocalRegistry::new(registry_dir.path());

        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let a = registry.fetch("p", "1.0.0", first.path()).unwrap();
        let b = registry.fetch("p", "1.0.0", second.path()).unwrap();

        assert!(a.root.join("commands/hello.md").is_file());
        assert!(a.integrity.starts_with("sha256-"));
        assert_eq!(a.integrity, b.integrity);
        assert!(a.resolved.starts_with("file://"));
    }

    #[test]
    fn fetches_and_unwraps_archives() {
        let registry_dir = TempDir::new().unwrap();
        write_archive(registry_dir.path(), "p", "0.3.0");
        let registry = LocalRegistry::new(registry_dir.path());

        assert_eq!(registry.versions("p").unwrap(), ["0.3.0"]);

        let dest = TempDir::new().unwrap();
        let fetched = registry.fetch("p", "0.3.0", dest.path()).unwrap();
        assert_eq!(fetched.root, dest.path().join("package"));
        assert_eq!(PackageConfig::load(&fetched.root).unwrap().version(), "0.3.0");
    }

    #[test]
    fn directory_source_offers_its_own_version() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), "p", "0.9.1");

        let source = open_source(&format!("file:{}", dir.path().display()), Path::new("/")).unwrap();
        assert_eq!(source.resolve("p", None).unwrap(), "0.9.1");
        assert!(source.versions("other").is_err());

        let dest = TempDir::new().unwrap();
        assert!(source.fetch("p", "1.0.0", dest.path()).is_err());
        source.fetch("p", "0.9.1", dest.path()).unwrap();
    }

    #[test]
    fn rejects_remote_sources() {
        assert!(open_source("https://example.test/p.tar.gz", Path::new(".")).is_err());
        assert!(open_source("github:owner/repo", Path::new(".")).is_err());
        assert!(open_registry(None, Some("https://registry.example.test"), Path::new(".")).is_err());
    }
}
