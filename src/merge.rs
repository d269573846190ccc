use std::{
    ffi::OsStr,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use clap::ValueEnum;
use tracing::{debug, info};

use crate::error::{PrunError, PrunResult};
use crate::tools::{command_line, resolve_executable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MergerKind {
    /// trimesh2's `mesh_cat`
    MeshCat,
    /// In-process OBJ concatenation
    Builtin,
}

/// Stitches the per-octant meshes into the final artifact.
pub trait MergeInvoker {
    fn merge(&self, parts: &[PathBuf], output: &Path) -> PrunResult<()>;

    fn describe(&self, parts: &[PathBuf], output: &Path) -> String;
}

#[derive(Debug, Clone)]
pub struct MeshCat {
    program: PathBuf,
}

impl MeshCat {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn resolve(program: &Path) -> PrunResult<Self> {
        resolve_executable(program)
            .map(Self::new)
            .ok_or_else(|| PrunError::ToolNotFound {
                tool: "mesh_cat",
                path: program.to_path_buf(),
            })
    }

    fn args<'a>(parts: &'a [PathBuf], output: &'a Path) -> impl Iterator<Item = &'a OsStr> {
        parts
            .iter()
            .map(|p| p.as_os_str())
            .chain([OsStr::new("-o"), output.as_os_str()])
    }
}

impl MergeInvoker for MeshCat {
    fn merge(&self, parts: &[PathBuf], output: &Path) -> PrunResult<()> {
        debug!("{}", self.describe(parts, output));
        let status = Command::new(&self.program)
            .args(Self::args(parts, output))
            .stdin(Stdio::null())
            .status()
            .map_err(|e| {
                PrunError::aggregation(format!("could not launch {}: {e}", self.program.display()))
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(PrunError::Aggregation {
                message: format!("{} exited with {status}", self.program.display()),
                code: status.code(),
            })
        }
    }

    fn describe(&self, parts: &[PathBuf], output: &Path) -> String {
        command_line(self.program.as_os_str(), Self::args(parts, output))
    }
}

/// Concatenates OBJ files with `tobj`, re-basing face indices per part.
///
/// Only geometry survives: positions, normals and triangles. Materials and
/// texture coordinates are not carried over.
#[derive(Debug, Clone, Default)]
pub struct BuiltinMerge;

impl BuiltinMerge {
    fn load(path: &Path) -> PrunResult<Vec<tobj::Model>> {
        let (models, _materials) = tobj::load_obj(
            path,
            &tobj::LoadOptions {
                single_index: true,
                triangulate: true,
                ..Default::default()
            },
        )
        .map_err(|e| PrunError::aggregation(format!("failed loading {}: {e}", path.display())))?;
        Ok(models)
    }

    fn write(parts: &[Vec<tobj::Model>], out: &mut impl Write) -> PrunResult<(usize, usize)> {
        let write_err = |e: std::io::Error| PrunError::aggregation(format!("write failed: {e}"));

        writeln!(out, "# {} parts merged by prun", parts.len()).map_err(write_err)?;

        let mut vertex_base = 0usize;
        let mut normal_base = 0usize;
        let mut faces = 0usize;

        for models in parts {
            for model in models {
                let mesh = &model.mesh;
                let vertex_count = mesh.positions.len() / 3;
                let has_normals = mesh.normals.len() == mesh.positions.len() && vertex_count > 0;

                writeln!(out, "o {}", model.name).map_err(write_err)?;
                for p in mesh.positions.chunks_exact(3) {
                    writeln!(out, "v {} {} {}", p[0], p[1], p[2]).map_err(write_err)?;
                }
                if has_normals {
                    for n in mesh.normals.chunks_exact(3) {
                        writeln!(out, "vn {} {} {}", n[0], n[1], n[2]).map_err(write_err)?;
                    }
                }

                for tri in mesh.indices.chunks_exact(3) {
                    let tri = [tri[0], tri[1], tri[2]];
                    let v = tri.map(|i| i as usize + vertex_base + 1);
                    if has_normals {
                        let n = tri.map(|i| i as usize + normal_base + 1);
                        writeln!(
                            out,
                            "f {}//{} {}//{} {}//{}",
                            v[0], n[0], v[1], n[1], v[2], n[2]
                        )
                        .map_err(write_err)?;
                    } else {
                        writeln!(out, "f {} {} {}", v[0], v[1], v[2]).map_err(write_err)?;
                    }
                    faces += 1;
                }

                vertex_base += vertex_count;
                if has_normals {
                    normal_base += vertex_count;
                }
            }
        }

        Ok((vertex_base, faces))
    }
}

impl MergeInvoker for BuiltinMerge {
    fn merge(&self, parts: &[PathBuf], output: &Path) -> PrunResult<()> {
        if parts.is_empty() {
            return Err(PrunError::aggregation("no meshes to merge"));
        }

        // Nothing touches the output until every part has loaded.
        let loaded = parts
            .iter()
            .map(|part| Self::load(part))
            .collect::<PrunResult<Vec<_>>>()?;

        let mut partial = output.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let written = File::create(&partial)
            .map_err(|e| PrunError::io(&partial, e))
            .and_then(|file| {
                let mut out = BufWriter::new(file);
                let counts = Self::write(&loaded, &mut out)?;
                out.flush().map_err(|e| PrunError::io(&partial, e))?;
                Ok(counts)
            });

        let (vertices, faces) = match written {
            Ok(counts) => counts,
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            }
        };
        std::fs::rename(&partial, output).map_err(|e| PrunError::io(output, e))?;

        info!(vertices, faces, "Wrote {}", output.display());
        Ok(())
    }

    fn describe(&self, parts: &[PathBuf], output: &Path) -> String {
        format!("<builtin merge of {} parts> -o {}", parts.len(), output.display())
    }
}
