//! OCI rootfs → Proxmox LXC template conversion.
//!
//! Produces a `<slug>-<unix_ts>.tar.zst` archive in the Proxmox template
//! cache from a bundle's rootfs, reusing an existing template for the same
//! image reference when one is already cached. The staging directory under
//! `<tmp>/lxc-rootfs-*` is removed on every exit path unless the debug flag
//! asks for a post-mortem copy.

use std::fs;
use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::bundle::{Bundle, RootfsSource};
use crate::{Error, Result, extract, tool};

/// Prefix of every staging directory, stable so crashed conversions can be
/// swept up at boot.
const STAGING_PREFIX: &str = "lxc-rootfs-";

/// Directories every LXC rootfs is expected to carry.
const LXC_DIRS: &[&str] = &["dev", "proc", "sys", "tmp", "var", "run", "etc"];

/// Default budget for a full conversion (large rootfs trees take a while).
const CONVERT_TIMEOUT: Duration = Duration::from_secs(600);

/// A resolved template in the Proxmox cache.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Template {
    /// Template name (file name without the `.tar.zst` suffix).
    pub name: String,
    /// Full path to the archive.
    pub path: PathBuf,
}

/// Converts OCI bundles into LXC template archives.
#[derive(Debug, Clone)]
pub struct Converter {
    /// Proxmox template cache directory.
    template_dir: PathBuf,
    /// Proxmox storage name queried via `pveam list`.
    storage: String,
    /// Preserve the staging directory for inspection.
    keep_staging: bool,
    /// Conversion time budget.
    timeout: Duration,
}

impl Converter {
    /// Creates a converter writing into `template_dir`, querying `storage`.
    pub fn new(template_dir: impl Into<PathBuf>, storage: impl Into<String>) -> Self {
        Self {
            template_dir: template_dir.into(),
            storage: storage.into(),
            keep_staging: false,
            timeout: CONVERT_TIMEOUT,
        }
    }

    /// Preserves the staging directory on exit (debug aid).
    #[must_use]
    pub fn keep_staging(mut self, keep: bool) -> Self {
        self.keep_staging = keep;
        self
    }

    /// Overrides the conversion time budget.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns a cached template for this bundle's image reference, or
    /// converts the rootfs into a fresh one.
    ///
    /// Conversion is idempotent per image reference: the cache is checked
    /// first, and a hit short-circuits without touching the rootfs.
    pub async fn resolve(&self, bundle: &Bundle, container_id: &str) -> Result<Template> {
        let slug = slugify(bundle.image_ref().unwrap_or(container_id));

        if let Some(template) = self.find_cached(&slug).await? {
            tracing::info!(template = %template.name, "reusing cached template");
            return Ok(template);
        }
        self.convert(bundle, container_id, &slug).await
    }

    /// Queries the template cache for a name derived from `slug`.
    ///
    /// Prefers `pveam list <storage>`; falls back to scanning the template
    /// directory when the tool is not on this host.
    async fn find_cached(&self, slug: &str) -> Result<Option<Template>> {
        let names = match tool::run("pveam", &["list", &self.storage], self.timeout).await {
            Ok(stdout) => parse_pveam_list(&stdout),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("pveam not found; scanning template directory instead");
                self.scan_template_dir()?
            }
            Err(e) => return Err(e),
        };

        for name in names {
            if let Some(stem) = name.strip_suffix(".tar.zst")
                && stem_matches(stem, slug)
            {
                return Ok(Some(Template {
                    name: stem.to_owned(),
                    path: self.template_dir.join(&name),
                }));
            }
        }
        Ok(None)
    }

    /// Lists `*.tar.zst` file names in the template directory.
    fn scan_template_dir(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.template_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && name.ends_with(".tar.zst")
            {
                names.push(name.to_owned());
            }
        }
        Ok(names)
    }

    /// Full conversion: stage, shape, verify, archive.
    async fn convert(&self, bundle: &Bundle, container_id: &str, slug: &str) -> Result<Template> {
        let name = self.unique_name(slug)?;
        let staging = Staging::create(&name, self.keep_staging)?;
        tracing::debug!(staging = %staging.path().display(), "staging rootfs");

        match &bundle.rootfs {
            RootfsSource::Directory(dir) => copy_tree(dir, staging.path())?,
            RootfsSource::Archive { path, format } => {
                extract::unpack(path, *format, staging.path())?;
            }
        }

        // The silent-copy failure mode produced near-empty archives; refuse
        // to archive a staging root with no regular files from the source.
        if !has_regular_file(staging.path())? {
            return Err(Error::RootfsEmpty {
                path: staging.path().to_path_buf(),
            });
        }

        shape_rootfs(staging.path(), bundle, container_id)?;

        fs::create_dir_all(&self.template_dir)?;
        let archive = self.template_dir.join(format!("{name}.tar.zst"));
        let archive_str = archive.to_string_lossy().into_owned();
        let staging_str = staging.path().to_string_lossy().into_owned();
        let result = tool::run(
            "tar",
            &["--zstd", "-cf", &archive_str, "-C", &staging_str, "."],
            self.timeout,
        )
        .await;

        if let Err(e) = result {
            // No partial archive survives a failed conversion.
            let _ = fs::remove_file(&archive);
            return Err(e);
        }

        tracing::info!(template = %name, path = %archive.display(), "template created");
        Ok(Template {
            name,
            path: archive,
        })
    }

    /// Composes `<slug>-<unix_ts>`, bumping the timestamp until the name is
    /// unused in the template directory.
    fn unique_name(&self, slug: &str) -> Result<String> {
        let mut ts = unix_ts();
        for _ in 0..1000 {
            let name = format!("{slug}-{ts}");
            if !self.template_dir.join(format!("{name}.tar.zst")).exists() {
                return Ok(name);
            }
            ts += 1;
        }
        Err(Error::Io(std::io::Error::other(
            "could not find an unused template name",
        )))
    }
}

/// Staging directory with removal on drop (success and failure paths alike).
struct Staging {
    path: PathBuf,
    keep: bool,
}

impl Staging {
    fn create(name: &str, keep: bool) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("{STAGING_PREFIX}{name}"));
        fs::create_dir_all(&path)?;
        Ok(Self { path, keep })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.keep {
            tracing::info!(path = %self.path.display(), "preserving staging directory");
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove staging directory");
        }
    }
}

/// Recursively copies `src` into `dst`, preserving permissions, ownership,
/// and symlinks. Every entry is error-checked; the first failure aborts with
/// the offending source path.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let copy_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| Error::RootfsCopy { path, source }
    };

    fs::create_dir_all(dst).map_err(copy_err(src))?;

    for entry in fs::read_dir(src).map_err(copy_err(src))? {
        let entry = entry.map_err(copy_err(src))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&from).map_err(copy_err(&from))?;

        if meta.is_dir() {
            copy_tree(&from, &to)?;
        } else if meta.is_symlink() {
            let target = fs::read_link(&from).map_err(copy_err(&from))?;
            std::os::unix::fs::symlink(&target, &to).map_err(copy_err(&from))?;
            std::os::unix::fs::lchown(&to, Some(meta.uid()), Some(meta.gid()))
                .map_err(copy_err(&from))?;
        } else {
            fs::copy(&from, &to).map_err(copy_err(&from))?;
            std::os::unix::fs::chown(&to, Some(meta.uid()), Some(meta.gid()))
                .map_err(copy_err(&from))?;
        }
    }

    let meta = fs::metadata(src).map_err(copy_err(src))?;
    fs::set_permissions(dst, meta.permissions()).map_err(copy_err(src))?;
    std::os::unix::fs::chown(dst, Some(meta.uid()), Some(meta.gid())).map_err(copy_err(src))?;
    Ok(())
}

/// Returns `true` when the tree contains at least one regular file.
fn has_regular_file(root: &Path) -> Result<bool> {
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let meta = fs::symlink_metadata(entry.path())?;
        if meta.is_file() {
            return Ok(true);
        }
        if meta.is_dir() && has_regular_file(&entry.path())? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Applies the minimal LXC rootfs shape: standard directories, hostname,
/// a DHCP network default, and a synthesized init when the image has none.
fn shape_rootfs(root: &Path, bundle: &Bundle, container_id: &str) -> Result<()> {
    for dir in LXC_DIRS {
        fs::create_dir_all(root.join(dir))?;
    }

    let hostname = bundle.hostname_or(container_id);
    fs::write(root.join("etc/hostname"), format!("{hostname}\n"))?;

    // Default network config; callers override via mounts when they need to.
    let interfaces = root.join("etc/network");
    fs::create_dir_all(&interfaces)?;
    fs::write(
        interfaces.join("interfaces"),
        "auto lo\niface lo inet loopback\n\nauto eth0\niface eth0 inet dhcp\n",
    )?;

    let init = root.join("sbin/init");
    if fs::symlink_metadata(&init).is_err() {
        fs::create_dir_all(root.join("sbin"))?;
        fs::write(&init, init_script(bundle))?;
        fs::set_permissions(&init, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Renders a POSIX shell init that execs the bundle's process.
fn init_script(bundle: &Bundle) -> String {
    let process = &bundle.spec.process;
    let mut script = String::from("#!/bin/sh\n");
    for kv in &process.env {
        script.push_str("export ");
        script.push_str(&shell_quote(kv));
        script.push('\n');
    }
    if process.cwd != "/" {
        script.push_str("cd ");
        script.push_str(&shell_quote(&process.cwd));
        script.push('\n');
    }
    script.push_str("exec");
    for arg in &process.args {
        script.push(' ');
        script.push_str(&shell_quote(arg));
    }
    script.push('\n');
    script
}

/// Single-quotes a string for POSIX sh.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Reduces an image reference or container id to a template name slug.
fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(64);
    if slug.is_empty() {
        slug.push_str("bundle");
    }
    slug
}

/// Matches a template file stem against a slug, with or without the
/// trailing `-<unix_ts>` a conversion appends.
fn stem_matches(stem: &str, slug: &str) -> bool {
    if stem == slug {
        return true;
    }
    stem.strip_prefix(slug)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|ts| !ts.is_empty() && ts.bytes().all(|b| b.is_ascii_digit()))
}

/// Template file names from `pveam list` output (volids like
/// `local:vztmpl/alpine-3.20.tar.zst`).
fn parse_pveam_list(stdout: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in stdout.lines() {
        let Some(volid) = line.split_whitespace().next() else {
            continue;
        };
        if !volid.contains(':') {
            continue;
        }
        if let Some(name) = volid.rsplit('/').next() {
            names.push(name.to_owned());
        }
    }
    names
}

/// Seconds since the epoch.
fn unix_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;

    fn bundle_with(config: &str, rootfs_files: &[(&str, &str)]) -> (tempfile::TempDir, Bundle) {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        for (rel, content) in rootfs_files {
            let path = rootfs.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
        }
        fs::write(tmp.path().join("config.json"), config).unwrap();
        let bundle = Bundle::load(tmp.path()).unwrap();
        (tmp, bundle)
    }

    const MINIMAL: &str = r#"{
        "ociVersion": "1.0.2",
        "hostname": "h1",
        "process": {
            "args": ["/bin/sh", "-c", "echo it's on"],
            "env": ["PATH=/usr/bin"],
            "cwd": "/srv"
        },
        "root": { "path": "rootfs" }
    }"#;

    #[test]
    fn slugify_cases() {
        assert_eq!(slugify("alpine:3.20"), "alpine-3-20");
        assert_eq!(slugify("ghcr.io/org/app@sha256:ab"), "ghcr-io-org-app-sha256-ab");
        assert_eq!(slugify("MyApp"), "myapp");
        assert_eq!(slugify("___"), "bundle");
    }

    #[test]
    fn stem_matching() {
        assert!(stem_matches("alpine-3-20", "alpine-3-20"));
        assert!(stem_matches("alpine-3-20-1712345678", "alpine-3-20"));
        assert!(!stem_matches("alpine-3-20-beta", "alpine-3-20"));
        assert!(!stem_matches("alpine-3-21-1712345678", "alpine-3-20"));
        assert!(!stem_matches("alpine-3-201", "alpine-3-20"));
    }

    #[test]
    fn pveam_list_parsing() {
        let out = "NAME SIZE\nlocal:vztmpl/debian-12-standard.tar.zst 120MB\n\
                   local:vztmpl/alpine-3-20-1712345678.tar.zst 3MB\n";
        assert_eq!(
            parse_pveam_list(out),
            vec![
                "debian-12-standard.tar.zst".to_owned(),
                "alpine-3-20-1712345678.tar.zst".to_owned()
            ]
        );
    }

    #[test]
    fn copy_tree_preserves_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/sh"), "#!").unwrap();
        fs::set_permissions(src.join("bin/sh"), fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("sh", src.join("bin/ash")).unwrap();

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();

        assert!(dst.join("bin/sh").is_file());
        let mode = fs::metadata(dst.join("bin/sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let link = fs::read_link(dst.join("bin/ash")).unwrap();
        assert_eq!(link, PathBuf::from("sh"));
    }

    #[test]
    fn copy_tree_reports_offending_path() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        let err = copy_tree(&missing, &tmp.path().join("dst")).unwrap_err();
        match err {
            Error::RootfsCopy { path, .. } => assert_eq!(path, missing),
            other => panic!("expected RootfsCopy, got {other}"),
        }
    }

    #[test]
    fn regular_file_detection() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        assert!(!has_regular_file(tmp.path()).unwrap());
        fs::write(tmp.path().join("a/b/f"), "x").unwrap();
        assert!(has_regular_file(tmp.path()).unwrap());
    }

    #[test]
    fn shape_writes_hostname_and_init() {
        let (_tmp, bundle) = bundle_with(MINIMAL, &[("bin/sh", "#!")]);
        let staged = tempfile::tempdir().unwrap();
        shape_rootfs(staged.path(), &bundle, "c1").unwrap();

        assert_eq!(
            fs::read_to_string(staged.path().join("etc/hostname")).unwrap(),
            "h1\n"
        );
        let init = fs::read_to_string(staged.path().join("sbin/init")).unwrap();
        assert!(init.starts_with("#!/bin/sh\n"));
        assert!(init.contains("export 'PATH=/usr/bin'"));
        assert!(init.contains("cd '/srv'"));
        assert!(init.contains("exec '/bin/sh' '-c' 'echo it'\\''s on'"));
        let mode = fs::metadata(staged.path().join("sbin/init"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
        for dir in LXC_DIRS {
            assert!(staged.path().join(dir).is_dir(), "missing {dir}");
        }
    }

    #[test]
    fn shape_keeps_existing_init() {
        let (_tmp, bundle) = bundle_with(MINIMAL, &[("bin/sh", "#!")]);
        let staged = tempfile::tempdir().unwrap();
        fs::create_dir_all(staged.path().join("sbin")).unwrap();
        fs::write(staged.path().join("sbin/init"), "real init").unwrap();
        shape_rootfs(staged.path(), &bundle, "c1").unwrap();
        assert_eq!(
            fs::read_to_string(staged.path().join("sbin/init")).unwrap(),
            "real init"
        );
    }

    #[tokio::test]
    async fn empty_rootfs_aborts_and_cleans_staging() {
        let (_tmp, bundle) = bundle_with(MINIMAL, &[]);
        let cache = tempfile::tempdir().unwrap();
        let converter = Converter::new(cache.path(), "local");

        let err = converter.convert(&bundle, "c1", "emptycase").await.unwrap_err();
        assert!(matches!(err, Error::RootfsEmpty { .. }));

        // Staging must not survive the failure.
        let leftovers: Vec<_> = fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("lxc-rootfs-emptycase")
            })
            .collect();
        assert!(leftovers.is_empty());
        // And no partial archive either.
        assert!(fs::read_dir(cache.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn debug_flag_preserves_staging() {
        let (_tmp, bundle) = bundle_with(MINIMAL, &[]);
        let cache = tempfile::tempdir().unwrap();
        let converter = Converter::new(cache.path(), "local").keep_staging(true);

        let _ = converter.convert(&bundle, "c1", "keepcase").await.unwrap_err();

        let kept: Vec<_> = fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("lxc-rootfs-keepcase")
            })
            .collect();
        assert!(!kept.is_empty());
        for entry in kept {
            let _ = fs::remove_dir_all(entry.path());
        }
    }

    #[test]
    fn find_cached_falls_back_to_dir_scan() {
        let cache = tempfile::tempdir().unwrap();
        fs::write(cache.path().join("alpine-3-20-1712345678.tar.zst"), "").unwrap();
        let converter = Converter::new(cache.path(), "local");
        let names = converter.scan_template_dir().unwrap();
        assert_eq!(names, vec!["alpine-3-20-1712345678.tar.zst".to_owned()]);
    }
}
