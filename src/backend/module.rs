//! Compiled modules and artifact export.
//!
//! A host `Module` owns its generated source, the lowered program, and
//! the device modules imported into it. Export shells out to the system C
//! toolchain; callers should check `cc_available()` first on machines
//! without one.

use crate::backend::Target;
use crate::ir::Program;
use log::debug;
use std::io::Write as _;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("C compiler '{compiler}' is not available")]
    ToolchainMissing { compiler: String },

    #[error("compilation failed with {status}:\n{stderr}")]
    CompileFailed { status: String, stderr: String },

    #[error("a {target} device module has no host entry to export")]
    NotAHostModule { target: Target },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A built module: generated source plus imported device modules.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    target: Target,
    source: String,
    program: Option<Program>,
    imported: Vec<Module>,
}

impl Module {
    pub(crate) fn host(
        name: &str,
        target: Target,
        source: String,
        program: Program,
        imported: Vec<Module>,
    ) -> Self {
        Module {
            name: name.to_string(),
            target,
            source,
            program: Some(program),
            imported,
        }
    }

    pub(crate) fn device(name: &str, target: Target, source: String) -> Self {
        Module {
            name: name.to_string(),
            target,
            source,
            program: None,
            imported: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// The generated source text of this module.
    pub fn get_source(&self) -> &str {
        &self.source
    }

    /// Device modules imported into this host module.
    pub fn imported_modules(&self) -> &[Module] {
        &self.imported
    }

    /// The lowered program, present on host modules only.
    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    /// Compiles the host source into a shared library at `path`.
    ///
    /// Packed-call shims stay unresolved in the artifact; they are bound
    /// when the library is loaded next to a packed-function runtime.
    pub fn export_library(&self, path: impl AsRef<Path>) -> Result<(), ModuleError> {
        let mut args = vec![
            "-shared".to_string(),
            "-fPIC".to_string(),
            "-O2".to_string(),
        ];
        if cfg!(target_os = "macos") {
            args.push("-undefined".to_string());
            args.push("dynamic_lookup".to_string());
        }
        self.compile(path.as_ref(), &args)
    }

    /// Compiles the host source into an object file at `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModuleError> {
        self.compile(
            path.as_ref(),
            &["-c".to_string(), "-fPIC".to_string(), "-O2".to_string()],
        )
    }

    fn compile(&self, out_path: &Path, args: &[String]) -> Result<(), ModuleError> {
        if self.program.is_none() {
            return Err(ModuleError::NotAHostModule {
                target: self.target,
            });
        }
        let compiler = cc_name();
        if !cc_available() {
            return Err(ModuleError::ToolchainMissing { compiler });
        }

        let mut source_file = tempfile::Builder::new()
            .prefix(&format!("{}_host", self.name))
            .suffix(".c")
            .tempfile()?;
        source_file.write_all(self.source.as_bytes())?;

        debug!(
            "running compile command: {compiler} {} -o {} {}",
            args.join(" "),
            out_path.display(),
            source_file.path().display()
        );
        let output = Command::new(&compiler)
            .args(args)
            .arg("-o")
            .arg(out_path)
            .arg(source_file.path())
            .output()?;
        if !output.status.success() {
            return Err(ModuleError::CompileFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

fn cc_name() -> String {
    std::env::var("CC").unwrap_or_else(|_| "cc".to_string())
}

/// Whether the system C compiler used by `export_library`/`save` responds.
pub fn cc_available() -> bool {
    Command::new(cc_name())
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_module_cannot_be_exported() {
        let module = Module::device("k", Target::Cuda, "__global__ void k() {}".to_string());
        assert!(matches!(
            module.export_library("/tmp/never_written.so"),
            Err(ModuleError::NotAHostModule { .. })
        ));
    }
}
