//! Shader modules, GLSL translation and the on-disk bytecode cache.
//!
//! - [`ShaderStage`] names a pipeline stage
//! - [`ShaderModule`] owns a backend shader module
//! - [`ShaderCompiler`] turns source text into SPIR-V; [`NagaCompiler`] is the
//!   default GLSL implementation
//! - [`ShaderCache`] stores compiled SPIR-V under a content hash of the source
//!   so a warm start never recompiles
//!
//! The cache is the only code in the rendering core that touches the
//! filesystem.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::backend::GpuBackend;
use crate::error::{RhiError, RhiResult};

/// First word of every SPIR-V binary.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Shader stage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn to_vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    /// Returns a human-readable name for the shader stage.
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
        }
    }

    fn to_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
            ShaderStage::Compute => naga::ShaderStage::Compute,
        }
    }
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Identity of a shader program, used in pipeline keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderId(u64);

impl ShaderId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Reinterpret little-endian bytes as SPIR-V words, checking size and magic.
pub fn spirv_words(bytes: &[u8]) -> RhiResult<Vec<u32>> {
    if bytes.is_empty() || !bytes.len().is_multiple_of(4) {
        return Err(RhiError::ShaderError(format!(
            "SPIR-V code must be 4-byte aligned, got {} bytes",
            bytes.len()
        )));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    check_magic(&words)?;
    Ok(words)
}

fn check_magic(words: &[u32]) -> RhiResult<()> {
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(()),
        Some(other) => Err(RhiError::ShaderError(format!(
            "bad SPIR-V magic {other:#010x}"
        ))),
        None => Err(RhiError::ShaderError("empty SPIR-V module".into())),
    }
}

/// A shader module owned through the GPU backend.
pub struct ShaderModule {
    backend: Arc<dyn GpuBackend>,
    module: vk::ShaderModule,
    stage: ShaderStage,
}

impl ShaderModule {
    pub fn new(backend: Arc<dyn GpuBackend>, stage: ShaderStage, code: &[u32]) -> RhiResult<Self> {
        check_magic(code)?;
        let module = backend.create_shader_module(code)?;
        debug!("Created {} shader module ({} words)", stage, code.len());
        Ok(Self {
            backend,
            module,
            stage,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.backend.destroy_shader_module(self.module);
        debug!("Destroyed {} shader module", self.stage);
    }
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("module", &self.module)
            .field("stage", &self.stage)
            .finish()
    }
}

/// Translates shader source into SPIR-V words.
pub trait ShaderCompiler: Send + Sync {
    /// `label` is only used in diagnostics.
    fn compile(&self, stage: ShaderStage, source: &str, label: &str) -> RhiResult<Vec<u32>>;
}

/// GLSL 450 to SPIR-V through naga.
#[derive(Clone, Copy, Debug, Default)]
pub struct NagaCompiler;

impl ShaderCompiler for NagaCompiler {
    fn compile(&self, stage: ShaderStage, source: &str, label: &str) -> RhiResult<Vec<u32>> {
        let mut frontend = naga::front::glsl::Frontend::default();
        let options = naga::front::glsl::Options::from(stage.to_naga());
        let module = frontend
            .parse(&options, source)
            .map_err(|e| RhiError::ShaderError(format!("{label}: GLSL parse failed: {e:?}")))?;

        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|e| RhiError::ShaderError(format!("{label}: validation failed: {e:?}")))?;

        naga::back::spv::write_vec(&module, &info, &naga::back::spv::Options::default(), None)
            .map_err(|e| RhiError::ShaderError(format!("{label}: SPIR-V emit failed: {e:?}")))
    }
}

/// Content-addressed SPIR-V cache in front of a [`ShaderCompiler`].
pub struct ShaderCache {
    dir: Option<PathBuf>,
    compiler: Box<dyn ShaderCompiler>,
    hits: u64,
    misses: u64,
}

impl ShaderCache {
    /// Cache entries under `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>, compiler: Box<dyn ShaderCompiler>) -> RhiResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("Shader cache at {:?}", dir);
        Ok(Self {
            dir: Some(dir),
            compiler,
            hits: 0,
            misses: 0,
        })
    }

    /// Compile every time, never touching the disk.
    pub fn disabled(compiler: Box<dyn ShaderCompiler>) -> Self {
        Self {
            dir: None,
            compiler,
            hits: 0,
            misses: 0,
        }
    }

    /// SHA-1 hex digest of the stage tag and source text.
    pub fn cache_key(stage: ShaderStage, source: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(stage.name().as_bytes());
        hasher.update([0u8]);
        hasher.update(source.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn entry_path(&self, stage: ShaderStage, source: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.spv", Self::cache_key(stage, source))))
    }

    /// Return SPIR-V for `source`, from disk when a valid entry exists.
    ///
    /// A missing or corrupt entry is recompiled and (re)written. Failing to
    /// write the entry is logged, not returned.
    pub fn load_or_compile(
        &mut self,
        stage: ShaderStage,
        source: &str,
        label: &str,
    ) -> RhiResult<Vec<u32>> {
        let path = self.entry_path(stage, source);

        if let Some(path) = &path
            && let Some(words) = read_entry(path)
        {
            self.hits += 1;
            debug!("Shader cache hit for {} ({})", label, stage);
            return Ok(words);
        }

        self.misses += 1;
        let words = self.compiler.compile(stage, source, label)?;
        check_magic(&words)?;

        if let Some(path) = &path {
            match fs::write(path, bytemuck::cast_slice::<u32, u8>(&words)) {
                Ok(()) => debug!("Shader cache entry written: {:?}", path),
                Err(e) => warn!("Could not write shader cache entry {:?}: {}", path, e),
            }
        }
        Ok(words)
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

fn read_entry(path: &Path) -> Option<Vec<u32>> {
    let bytes = fs::read(path).ok()?;
    match spirv_words(&bytes) {
        Ok(words) => Some(words),
        Err(e) => {
            warn!("Discarding corrupt shader cache entry {:?}: {}", path, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::headless::{HeadlessBackend, HeadlessEvent};

    const VERTEX_SRC: &str = r#"#version 450
layout(location = 0) in vec3 a_position;
void main() {
    gl_Position = vec4(a_position, 1.0);
}
"#;

    struct CountingCompiler(Arc<AtomicUsize>);

    impl ShaderCompiler for CountingCompiler {
        fn compile(&self, _stage: ShaderStage, source: &str, _label: &str) -> RhiResult<Vec<u32>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![SPIRV_MAGIC, 0x0001_0000, source.len() as u32])
        }
    }

    fn counting() -> (Box<dyn ShaderCompiler>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (Box::new(CountingCompiler(count.clone())), count)
    }

    #[test]
    fn test_shader_stage_to_vk_stage() {
        assert_eq!(ShaderStage::Vertex.to_vk_stage(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(
            ShaderStage::Fragment.to_vk_stage(),
            vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(format!("{}", ShaderStage::Compute), "compute");
    }

    #[test]
    fn test_spirv_words() {
        assert!(spirv_words(&[0u8; 5]).is_err());
        assert!(spirv_words(&[0u8; 8]).is_err());
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&7u32.to_le_bytes());
        assert_eq!(spirv_words(&bytes).unwrap(), vec![SPIRV_MAGIC, 7]);
    }

    #[test]
    fn test_cache_key_depends_on_stage_and_source() {
        let a = ShaderCache::cache_key(ShaderStage::Vertex, "void main() {}");
        let b = ShaderCache::cache_key(ShaderStage::Fragment, "void main() {}");
        let c = ShaderCache::cache_key(ShaderStage::Vertex, "void main() { }");
        assert_eq!(a.len(), 40);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, ShaderCache::cache_key(ShaderStage::Vertex, "void main() {}"));
    }

    #[test]
    fn test_hit_avoids_recompile() {
        let dir = tempfile::tempdir().unwrap();
        let (compiler, count) = counting();
        let mut cache = ShaderCache::new(dir.path(), compiler).unwrap();

        let first = cache.load_or_compile(ShaderStage::Vertex, "src", "t").unwrap();
        let second = cache.load_or_compile(ShaderStage::Vertex, "src", "t").unwrap();

        assert_eq!(first, second);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
        assert!(cache.entry_path(ShaderStage::Vertex, "src").unwrap().exists());
    }

    #[test]
    fn test_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (compiler, count) = counting();
        ShaderCache::new(dir.path(), compiler)
            .unwrap()
            .load_or_compile(ShaderStage::Fragment, "src", "t")
            .unwrap();

        let (compiler, _) = counting();
        let mut warm = ShaderCache::new(dir.path(), compiler).unwrap();
        warm.load_or_compile(ShaderStage::Fragment, "src", "t").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(warm.hits(), 1);
    }

    #[test]
    fn test_corrupt_entry_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let (compiler, count) = counting();
        let mut cache = ShaderCache::new(dir.path(), compiler).unwrap();
        let path = cache.entry_path(ShaderStage::Vertex, "src").unwrap();
        fs::write(&path, b"not spirv!!!").unwrap();

        let words = cache.load_or_compile(ShaderStage::Vertex, "src", "t").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(spirv_words(&fs::read(&path).unwrap()).unwrap(), words);
    }

    #[test]
    fn test_disabled_cache_always_compiles() {
        let (compiler, count) = counting();
        let mut cache = ShaderCache::disabled(compiler);
        cache.load_or_compile(ShaderStage::Vertex, "src", "t").unwrap();
        cache.load_or_compile(ShaderStage::Vertex, "src", "t").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(cache.dir().is_none());
    }

    #[test]
    fn test_naga_compiles_glsl() {
        let words = NagaCompiler
            .compile(ShaderStage::Vertex, VERTEX_SRC, "test.vert")
            .unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn test_naga_reports_errors() {
        let err = NagaCompiler
            .compile(ShaderStage::Fragment, "#version 450\nvoid main( {", "broken.frag")
            .unwrap_err();
        assert!(err.to_string().contains("broken.frag"));
    }

    #[test]
    fn test_module_lifecycle() {
        let backend = HeadlessBackend::new();
        let module = ShaderModule::new(backend.clone(), ShaderStage::Vertex, &[SPIRV_MAGIC, 0]).unwrap();
        let handle = module.handle();
        drop(module);
        assert!(
            backend
                .events()
                .contains(&HeadlessEvent::DestroyShaderModule(handle))
        );
        assert!(ShaderModule::new(backend, ShaderStage::Vertex, &[1, 2]).is_err());
    }
}
