use super::{Movement, Target};
use crate::error::{Error, Result};
use crate::iet::Node;
use crate::options::{CompilerOptions, RawOptions};
use crate::symbolics::Function;

/// OpenMP device offloading.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenMp;

impl Target for OpenMp {
    fn name(&self) -> &'static str {
        "openmp"
    }

    fn default_options(&self, raw: &mut RawOptions) {
        raw.set_default("linearize", true);
    }

    fn check_options(&self, options: &CompilerOptions) -> Result<()> {
        if !options.gpu_create.is_empty() {
            return Err(Error::configuration(
                "unsupported gpu-create option for omp operators",
                ["gpu-create"],
            ));
        }
        Ok(())
    }

    fn loop_pragma(
        &self,
        collapse: usize,
        _tiles: Option<&[usize]>,
        chunk: Option<usize>,
    ) -> String {
        let mut pragma = String::from("omp target teams distribute parallel for");
        if collapse > 1 {
            pragma.push_str(&format!(" collapse({collapse})"));
        }
        if let Some(chunk) = chunk {
            pragma.push_str(&format!(" schedule(dynamic,{chunk})"));
        }
        pragma
    }

    fn device_init(&self) -> Vec<Node> {
        vec![Node::Call {
            name: "omp_set_default_device".to_string(),
            args: vec!["deviceid".to_string()],
        }]
    }

    fn data_pragma(&self, f: &Function, movement: Movement) -> String {
        let name = f.name();
        match movement {
            Movement::CopyIn => format!("omp target enter data map(to: {name})"),
            Movement::Create => format!("omp target enter data map(alloc: {name})"),
            Movement::CopyOut => format!("omp target exit data map(from: {name})"),
            Movement::Delete => format!("omp target exit data map(delete: {name})"),
        }
    }

    fn update_device(&self, f: &Function, _queue: &str) -> String {
        format!("omp target update to({}) nowait", f.name())
    }

    fn wait(&self, _queue: &str) -> String {
        "omp taskwait".to_string()
    }
}
