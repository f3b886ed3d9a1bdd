//! Two-tier compilation cache: a byte-budget in-memory LRU over a
//! fingerprint-named on-disk store.
//!
//! The cache key is a SHA-256 of the exact handler source bytes, with no
//! normalization. Compilation wraps the fragment into an ES module and
//! parses it in a scratch engine context; the validated module image is the
//! artifact. Concurrent misses for the same fingerprint may compile
//! redundantly; the compile step runs outside the map lock and the last
//! insert wins.

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use lru::LruCache;
use parking_lot::Mutex;
use rquickjs::{CatchResultExt, CaughtError, Context, Module};
use sha2::{Digest, Sha256};

use crate::{config::RuntimeConfig, error::SourceLocation, sandbox::stack_location};

/// SHA-256 of the handler source bytes.
pub type Fingerprint = [u8; 32];

pub(crate) const MODULE_PREFIX: &str = "export function __handler() {\n";
pub(crate) const MODULE_SUFFIX: &str = "\n}\n";
/// Lines `MODULE_PREFIX` adds before the handler source.
pub(crate) const SOURCE_LINE_OFFSET: u32 = 1;
pub(crate) const HANDLER_EXPORT: &str = "__handler";

/// On-disk entry layout version; unknown versions are ignored and deleted.
const DISK_FORMAT_VERSION: u16 = 1;
const DISK_HEADER_LEN: usize = 6;

/// Engine-ready representation of a handler.
///
/// The module image is the validated ES-module wrapping of the handler
/// source; sandboxes borrow it by reference through the surrounding [`Arc`].
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    fingerprint: Fingerprint,
    module: String,
}

impl CompiledArtifact {
    #[must_use]
    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    #[must_use]
    pub fn fingerprint_hex(&self) -> String {
        hex(&self.fingerprint)
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.module.len()
    }

    pub(crate) fn module_source(&self) -> &str {
        &self.module
    }

    /// The original handler fragment, recovered from the module image.
    pub(crate) fn handler_source(&self) -> &str {
        self.module
            .strip_prefix(MODULE_PREFIX)
            .and_then(|s| s.strip_suffix(MODULE_SUFFIX))
            .unwrap_or(&self.module)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: usize,
    pub total_bytes: usize,
}

#[derive(Debug)]
pub struct CompileOutput {
    pub artifact: Arc<CompiledArtifact>,
    pub cache_hit: bool,
    pub compile_duration: Duration,
}

#[must_use]
pub fn fingerprint(source: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(source);
    hasher.finalize().into()
}

fn hex(fingerprint: &Fingerprint) -> String {
    let mut out = String::with_capacity(fingerprint.len() * 2);
    for b in fingerprint {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

struct MemoryTier {
    entries: LruCache<Fingerprint, Arc<CompiledArtifact>>,
    total_bytes: usize,
    max_bytes: usize,
}

impl MemoryTier {
    fn get(&mut self, fingerprint: &Fingerprint) -> Option<Arc<CompiledArtifact>> {
        self.entries.get(fingerprint).cloned()
    }

    fn insert(&mut self, artifact: Arc<CompiledArtifact>) {
        let size = artifact.byte_size();
        if let Some(previous) = self.entries.put(artifact.fingerprint, artifact) {
            self.total_bytes -= previous.byte_size();
        }
        self.total_bytes += size;
        while self.total_bytes > self.max_bytes {
            let Some((_, evicted)) = self.entries.pop_lru() else {
                break;
            };
            self.total_bytes -= evicted.byte_size();
            tracing::debug!(
                fingerprint = %hex(&evicted.fingerprint),
                "evicted compiled artifact from memory tier"
            );
        }
    }

    fn remove(&mut self, fingerprint: &Fingerprint) {
        if let Some(removed) = self.entries.pop(fingerprint) {
            self.total_bytes -= removed.byte_size();
        }
    }
}

struct DiskTier {
    dir: PathBuf,
    max_entries: usize,
}

pub struct CompilationCache {
    memory: Mutex<MemoryTier>,
    disk: Option<DiskTier>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CompilationCache {
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            memory: Mutex::new(MemoryTier {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                max_bytes: config.max_cache_bytes,
            }),
            disk: config.cache_dir.clone().map(|dir| DiskTier {
                dir,
                max_entries: config.max_cache_disk_entries,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the artifact for `source`, compiling on a full miss.
    ///
    /// # Errors
    /// Returns a [`CompileError`] when the handler fails to parse.
    pub async fn get_or_compile(&self, source: &str) -> Result<CompileOutput, CompileError> {
        let fingerprint = fingerprint(source.as_bytes());
        let started = Instant::now();

        if let Some(artifact) = self.memory.lock().get(&fingerprint) {
            self.record_hit();
            return Ok(CompileOutput {
                artifact,
                cache_hit: true,
                compile_duration: started.elapsed(),
            });
        }

        if let Some(disk) = &self.disk
            && let Some(artifact) = disk.load(&fingerprint).await
        {
            let artifact = Arc::new(artifact);
            self.memory.lock().insert(Arc::clone(&artifact));
            self.record_hit();
            return Ok(CompileOutput {
                artifact,
                cache_hit: true,
                compile_duration: started.elapsed(),
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("nexus_compile_cache_misses_total").increment(1);

        let artifact = Arc::new(self.compile(source, fingerprint)?);
        let compile_duration = started.elapsed();
        metrics::histogram!("nexus_compile_duration_us")
            .record(compile_duration.as_micros() as f64);

        if let Some(disk) = &self.disk {
            disk.store(&artifact).await;
        }
        self.memory.lock().insert(Arc::clone(&artifact));

        Ok(CompileOutput {
            artifact,
            cache_hit: false,
            compile_duration,
        })
    }

    /// Remove an artifact from both tiers.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) {
        self.memory.lock().remove(fingerprint);
        if let Some(disk) = &self.disk {
            let _ = tokio::fs::remove_file(disk.dir.join(hex(fingerprint))).await;
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let memory = self.memory.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: memory.entries.len(),
            total_bytes: memory.total_bytes,
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("nexus_compile_cache_hits_total").increment(1);
    }

    /// Parse-validate the wrapped handler in a scratch engine.
    ///
    /// Engine objects stay confined to the calling thread; nothing declared
    /// here outlives the compile.
    fn compile(
        &self,
        source: &str,
        fingerprint: Fingerprint,
    ) -> Result<CompiledArtifact, CompileError> {
        let module = format!("{MODULE_PREFIX}{source}{MODULE_SUFFIX}");
        let module_name = format!("panel-{}.js", &hex(&fingerprint)[..16]);

        let allocation = |e: rquickjs::Error| CompileError {
            message: format!("compile engine allocation failed: {e}"),
            location: None,
        };
        let runtime = rquickjs::Runtime::new().map_err(allocation)?;
        let context = Context::full(&runtime).map_err(allocation)?;
        context.with(|ctx| {
            match Module::declare(ctx.clone(), module_name, module.as_str()).catch(&ctx) {
                Ok(_declared) => Ok(()),
                Err(caught) => Err(describe_compile_failure(&caught)),
            }
        })?;

        Ok(CompiledArtifact {
            fingerprint,
            module,
        })
    }
}

fn describe_compile_failure(caught: &CaughtError<'_>) -> CompileError {
    match caught {
        CaughtError::Exception(exception) => {
            let message = exception
                .message()
                .unwrap_or_else(|| "handler failed to parse".to_owned());
            let location = exception
                .as_object()
                .get::<_, Option<String>>("stack")
                .ok()
                .flatten()
                .as_deref()
                .and_then(stack_location);
            CompileError { message, location }
        }
        other => CompileError {
            message: other.to_string(),
            location: None,
        },
    }
}

impl DiskTier {
    async fn load(&self, fingerprint: &Fingerprint) -> Option<CompiledArtifact> {
        let path = self.dir.join(hex(fingerprint));
        let bytes = tokio::fs::read(&path).await.ok()?;
        match decode_entry(&bytes) {
            Some(module) => Some(CompiledArtifact {
                fingerprint: *fingerprint,
                module,
            }),
            None => {
                tracing::warn!(path = %path.display(), "dropping corrupt cache entry");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    }

    async fn store(&self, artifact: &CompiledArtifact) {
        if let Err(e) = self.try_store(artifact).await {
            tracing::warn!(
                fingerprint = %artifact.fingerprint_hex(),
                "failed to persist compiled artifact: {e}"
            );
        }
    }

    async fn try_store(&self, artifact: &CompiledArtifact) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(artifact.fingerprint_hex());
        write_file_atomic(&path, &encode_entry(artifact.module_source())).await?;
        self.prune().await
    }

    /// Drop the oldest entries once the tier exceeds its entry budget.
    async fn prune(&self) -> std::io::Result<()> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() != 64 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            entries.push((modified, entry.path()));
        }
        if entries.len() <= self.max_entries {
            return Ok(());
        }
        entries.sort_by_key(|(modified, _)| *modified);
        let excess = entries.len() - self.max_entries;
        for (_, path) in entries.into_iter().take(excess) {
            let _ = tokio::fs::remove_file(path).await;
        }
        Ok(())
    }
}

fn encode_entry(module: &str) -> Vec<u8> {
    let payload = module.as_bytes();
    let mut out = Vec::with_capacity(DISK_HEADER_LEN + payload.len());
    out.extend_from_slice(&u32::try_from(payload.len()).unwrap_or(u32::MAX).to_le_bytes());
    out.extend_from_slice(&DISK_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode_entry(bytes: &[u8]) -> Option<String> {
    if bytes.len() < DISK_HEADER_LEN {
        return None;
    }
    let len = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
    let version = u16::from_le_bytes(bytes[4..6].try_into().ok()?);
    if version != DISK_FORMAT_VERSION || bytes.len() != DISK_HEADER_LEN + len {
        return None;
    }
    String::from_utf8(bytes[DISK_HEADER_LEN..].to_vec()).ok()
}

async fn write_file_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    static WRITE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let sequence = WRITE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let tmp_path = path.with_extension(format!("tmp-{}-{sequence}", std::process::id()));

    tokio::fs::write(&tmp_path, bytes).await?;
    match tokio::fs::rename(&tmp_path, path).await {
        Ok(()) => Ok(()),
        // Windows doesn't atomically replace by default; treat a concurrent
        // winner as success.
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            Ok(())
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            Err(e)
        }
    }
}
