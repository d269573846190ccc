use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

/// Number of sub-jobs a job is split into: one per child of an octree node.
pub const FAN_OUT: usize = 8;

/// The closed set of positional signatures the compute binary accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// `<sdf> <portals> <versor octaves> <versor scale> <res> <a> <b> <ox> <oy> <oz> <out>`
    Portals,
    /// `<sdf> <poly4d|RANDOM> <res> <a> <b> <ox> <oy> <oz> <out>`
    Polynomial,
    /// `<sdf> <versor octaves> <versor scale> <res> <a> <b> <ox> <oy> <oz> <out>`
    Versor,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Polynomial, Variant::Versor, Variant::Portals];

    /// Positional token count, output path included.
    pub fn arity(self) -> usize {
        match self {
            Variant::Polynomial => 9,
            Variant::Versor => 10,
            Variant::Portals => 11,
        }
    }

    /// Position of the resolution among the positional tokens.
    pub fn resolution_slot(self) -> usize {
        match self {
            Variant::Polynomial => 2,
            Variant::Versor => 3,
            Variant::Portals => 4,
        }
    }

    pub fn from_arity(arity: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.arity() == arity)
    }

    pub fn synopsis(self) -> &'static str {
        match self {
            Variant::Portals => {
                "<SDF *.f3d> <portals *.txt> <versor octaves> <versor scale> <output resolution> <a> <b> <offset x> <offset y> <offset z> <output *.obj>"
            }
            Variant::Polynomial => {
                "<SDF *.f3d> <P(q) *.poly4d, or the word RANDOM> <output resolution> <a> <b> <offset x> <offset y> <offset z> <output *.obj>"
            }
            Variant::Versor => {
                "<SDF *.f3d> <versor octaves> <versor scale> <output resolution> <a> <b> <offset x> <offset y> <offset z> <output *.obj>"
            }
        }
    }
}

/// One logical launch, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub variant: Variant,
    /// Forwarded verbatim, in order, with the resolution and output removed.
    pub inputs: Vec<String>,
    pub output_resolution: u32,
    pub output_path: PathBuf,
    pub subsection_prefix: String,
    pub keep_intermediates: bool,
}

/// One invocation of the compute binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubJob {
    pub index: usize,
    /// Inputs with the halved resolution spliced back into its slot.
    pub params: Vec<String>,
    pub output: PathBuf,
    pub octree_label: String,
}

impl SubJob {
    /// Argument vector handed to the compute binary.
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv: Vec<OsString> = self.params.iter().map(OsString::from).collect();
        argv.push(self.output.clone().into_os_string());
        argv.push(OsString::from(&self.octree_label));
        argv
    }
}

/// `{output}.{index}.obj`, the name sub-job `index` writes to.
pub fn intermediate_path(output: &Path, index: usize) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(format!(".{index}.obj"));
    PathBuf::from(name)
}

impl JobSpec {
    /// Each sub-job covers one octant, so it runs at half the linear resolution.
    pub fn sub_resolution(&self) -> u32 {
        self.output_resolution / 2
    }

    pub fn intermediates(&self) -> impl Iterator<Item = PathBuf> + '_ {
        (0..FAN_OUT).map(|i| intermediate_path(&self.output_path, i))
    }

    pub fn expand(&self) -> Vec<SubJob> {
        let slot = self.variant.resolution_slot();
        let mut params = Vec::with_capacity(self.inputs.len() + 1);
        params.extend_from_slice(&self.inputs[..slot]);
        params.push(self.sub_resolution().to_string());
        params.extend_from_slice(&self.inputs[slot..]);

        (0..FAN_OUT)
            .map(|index| SubJob {
                index,
                params: params.clone(),
                output: intermediate_path(&self.output_path, index),
                octree_label: format!("{}{index}", self.subsection_prefix),
            })
            .collect()
    }
}
