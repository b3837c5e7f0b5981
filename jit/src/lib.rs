//! Executable-memory runtime for dropforge-codegen.
//!
//! The code generator stops at a [`FinalizedCode`] blob; this crate maps
//! those bytes into executable pages and hands back function pointers. A
//! [`JitRuntime`] owns every mapping it creates; mappings release on
//! [`JitRuntime::dispose`] or when the runtime drops.

#![warn(missing_docs)]

mod memory;

use anyhow::{anyhow, Result};
use dropforge_codegen::{Arch, Compiler, FinalizedCode};
use target_lexicon::{Architecture, Triple};

pub use memory::Mapping;

/// Anything that can turn finalized code into an executable pointer.
///
/// The code generator calls this at the very end of a build; callers keep
/// the returned pointer valid by keeping the runtime alive and not
/// disposing the mapping.
pub trait ExecutableMemory {
    /// Map the blob and return the entry pointer.
    fn map_exec(&mut self, code: &FinalizedCode) -> Result<*const u8>;

    /// Release the mapping that produced `ptr`. Returns whether a mapping
    /// was found.
    fn dispose(&mut self, ptr: *const u8) -> bool;
}

/// The architecture of the host this process runs on, when supported.
pub fn host_arch() -> Option<Arch> {
    match Triple::host().architecture {
        Architecture::X86_64 => Some(Arch::X64),
        Architecture::Aarch64(_) => Some(Arch::Aarch64),
        Architecture::X86_32(_) => Some(Arch::X86),
        Architecture::Arm(_) => Some(Arch::Arm),
        _ => None,
    }
}

/// A compiler pre-targeted at the host.
pub fn host_compiler() -> Result<Compiler> {
    let arch = host_arch().ok_or_else(|| anyhow!("unsupported host architecture"))?;
    Compiler::new(arch).map_err(Into::into)
}

/// The default executable-memory runtime: one allocation per finalized
/// program, disposed explicitly or on drop.
#[derive(Default)]
pub struct JitRuntime {
    mappings: Vec<Mapping>,
}

impl JitRuntime {
    /// An empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// True when no mappings are live.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl ExecutableMemory for JitRuntime {
    fn map_exec(&mut self, code: &FinalizedCode) -> Result<*const u8> {
        if host_arch() != Some(code.arch) {
            return Err(anyhow!(
                "finalized code targets {:?} but the host is {:?}",
                code.arch,
                host_arch()
            ));
        }
        let mapping = Mapping::new(code)?;
        let ptr = unsafe { mapping.ptr().add(code.entry as usize) };
        self.mappings.push(mapping);
        Ok(ptr)
    }

    fn dispose(&mut self, ptr: *const u8) -> bool {
        let before = self.mappings.len();
        self.mappings.retain(|m| {
            let start = m.ptr() as usize;
            let p = ptr as usize;
            !(start..start + m.len()).contains(&p)
        });
        self.mappings.len() != before
    }
}

/// Finalize `compiler` and map the result, returning the entry pointer.
///
/// The pointer stays valid for the lifetime of the mapping inside
/// `runtime`. Casting it to the right `extern "C" fn` type is the
/// caller's unsafe contract.
pub fn build(compiler: &mut Compiler, runtime: &mut impl ExecutableMemory) -> Result<*const u8> {
    let code = compiler.finalize()?;
    runtime.map_exec(&code)
}
