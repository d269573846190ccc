//! Grammar for the job tokens: optional `KEEP`, optional `SUB <label>`, then
//! exactly one of the positional signatures in [`Variant`].

use std::path::PathBuf;

use crate::error::{PrunError, PrunResult};
use crate::job::{FAN_OUT, JobSpec, Variant};

const KEEP: &str = "KEEP";
const SUB: &str = "SUB";

pub fn parse_job(tokens: &[String]) -> PrunResult<JobSpec> {
    if tokens.is_empty() {
        return Err(PrunError::Usage("no job arguments given".into()));
    }

    let mut rest = tokens;

    let keep_intermediates = rest.first().is_some_and(|t| t == KEEP);
    if keep_intermediates {
        rest = &rest[1..];
    }

    let mut subsection_prefix = String::new();
    if rest.first().is_some_and(|t| t == SUB) {
        let Some(label) = rest.get(1) else {
            return Err(PrunError::Usage("SUB requires an octree label".into()));
        };
        validate_label(label)?;
        subsection_prefix = label.clone();
        rest = &rest[2..];
    }

    if rest.first().is_some_and(|t| t == KEEP || t == SUB) {
        return Err(PrunError::Usage(
            "directives must lead, in the order KEEP SUB".into(),
        ));
    }

    let Some(variant) = Variant::from_arity(rest.len()) else {
        return Err(PrunError::Usage(format!(
            "expected 9, 10 or 11 positional arguments, got {}",
            rest.len()
        )));
    };

    let slot = variant.resolution_slot();
    let output_resolution = parse_resolution(&rest[slot])?;

    let (output, positional) = (&rest[rest.len() - 1], &rest[..rest.len() - 1]);

    let inputs = positional
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != slot)
        .map(|(_, t)| t.clone())
        .collect();

    Ok(JobSpec {
        variant,
        inputs,
        output_resolution,
        output_path: PathBuf::from(output),
        subsection_prefix,
        keep_intermediates,
    })
}

fn parse_resolution(token: &str) -> PrunResult<u32> {
    let value = token.parse::<u32>().map_err(|e| PrunError::Parse {
        value: token.to_string(),
        reason: e.to_string(),
    })?;
    if value == 0 {
        return Err(PrunError::Parse {
            value: token.to_string(),
            reason: "resolution must be positive".into(),
        });
    }
    Ok(value)
}

/// Octree labels are one digit per level, each naming one of the eight children.
fn validate_label(label: &str) -> PrunResult<()> {
    let valid = !label.is_empty()
        && label
            .chars()
            .all(|c| c.to_digit(10).is_some_and(|d| (d as usize) < FAN_OUT));
    if valid {
        Ok(())
    } else {
        Err(PrunError::Usage(format!(
            "octree label {label:?} must be a non-empty string of digits 0-7"
        )))
    }
}

pub fn usage(program: &str) -> String {
    let mut text = String::from("USAGE:\n");
    text.push_str("To create a shaped julia set from a distance field, use one of:\n");
    for variant in [Variant::Portals, Variant::Versor, Variant::Polynomial] {
        text.push_str(&format!(
            " {program} [OPTIONS] [KEEP] [SUB <label>] {}\n",
            variant.synopsis()
        ));
    }
    text.push_str(&format!(
        "\nAll parameters are passed along to the compute binary, which is run {FAN_OUT}X in parallel,\n\
         once per octree child, each at half the output resolution.\n\n\
         Optionally, two directives may precede the parameters:\n\
         \x20   - 'KEEP' with no arguments: the per-job meshes (e.g. out.obj.0.obj) are stitched\n\
         \x20     together but left on disk afterwards.\n\
         \x20   - 'SUB' with one argument: confine the run to an octree sub-section, e.g. 'SUB 1'\n\
         \x20     computes octree node #1 in {FAN_OUT}X parallel. Labels nest, so 'SUB 123' computes\n\
         \x20     a 1/512th size region.\n\n\
         When both are used they must appear in the order KEEP SUB, e.g. '{program} KEEP SUB 123 <sdf.f3d> ...'\n\n\
         Run '{program} --help' for launcher options (compute binary, merger, failure policy).\n"
    ));
    text
}
