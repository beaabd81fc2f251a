use super::{Movement, Target};
use crate::iet::Node;
use crate::symbolics::Function;

/// OpenACC device offloading. Supports `gpu-create` and async queues.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAcc;

impl Target for OpenAcc {
    fn name(&self) -> &'static str {
        "openacc"
    }

    fn loop_pragma(
        &self,
        collapse: usize,
        tiles: Option<&[usize]>,
        _chunk: Option<usize>,
    ) -> String {
        let mut pragma = String::from("acc parallel loop");
        if collapse > 1 {
            pragma.push_str(&format!(" collapse({collapse})"));
        }
        if let Some(tiles) = tiles {
            let sizes: Vec<String> = tiles.iter().map(usize::to_string).collect();
            pragma.push_str(&format!(" tile({})", sizes.join(",")));
        }
        pragma
    }

    fn device_init(&self) -> Vec<Node> {
        vec![
            Node::Call {
                name: "acc_init".to_string(),
                args: vec!["acc_device_nvidia".to_string()],
            },
            Node::Call {
                name: "acc_set_device_num".to_string(),
                args: vec!["deviceid".to_string(), "acc_device_nvidia".to_string()],
            },
        ]
    }

    fn data_pragma(&self, f: &Function, movement: Movement) -> String {
        let name = f.name();
        match movement {
            Movement::CopyIn => format!("acc enter data copyin({name})"),
            Movement::Create => format!("acc enter data create({name})"),
            Movement::CopyOut => format!("acc exit data copyout({name})"),
            Movement::Delete => format!("acc exit data delete({name})"),
        }
    }

    fn update_device(&self, f: &Function, queue: &str) -> String {
        format!("acc update device({}) async({queue})", f.name())
    }

    fn wait(&self, queue: &str) -> String {
        format!("acc wait({queue})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolics::Dimension;

    #[test]
    fn pragmas_name_the_function_and_queue() {
        let u = Function::dense("u", vec![Dimension::space("x")], 1);
        assert_eq!(OpenAcc.data_pragma(&u, Movement::Delete), "acc exit data delete(u)");
        assert_eq!(OpenAcc.update_device(&u, "q0"), "acc update device(u) async(q0)");
        assert_eq!(OpenAcc.wait("q0"), "acc wait(q0)");
        assert_eq!(OpenAcc.loop_pragma(1, None, Some(3)), "acc parallel loop");
    }
}
