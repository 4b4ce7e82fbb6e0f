use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::opcode::OpCode;

use super::Tape;

impl Serialize for Tape {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !self.free_vars.is_empty() {
            return Err(serde::ser::Error::custom(
                "cannot serialize a Tape with free variables; \
                 substitute them before sorting",
            ));
        }
        let mut s = serializer.serialize_struct("Tape", 7)?;
        s.serialize_field("opcodes", &self.opcodes)?;
        s.serialize_field("arg_indices", &self.arg_indices)?;
        s.serialize_field("results", &self.results)?;
        s.serialize_field("constants", &self.constants)?;
        s.serialize_field("worksize", &self.worksize)?;
        s.serialize_field("input_nnz", &self.input_nnz)?;
        s.serialize_field("output_nnz", &self.output_nnz)?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for Tape {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct TapeData {
            opcodes: Vec<OpCode>,
            arg_indices: Vec<[u32; 2]>,
            results: Vec<u32>,
            constants: Vec<f64>,
            worksize: usize,
            input_nnz: Vec<usize>,
            output_nnz: Vec<usize>,
        }

        let data = TapeData::deserialize(deserializer)?;
        let n = data.opcodes.len();
        if data.arg_indices.len() != n || data.results.len() != n || data.constants.len() != n {
            return Err(serde::de::Error::custom("tape columns have different lengths"));
        }
        if data.opcodes.contains(&OpCode::Parameter) {
            return Err(serde::de::Error::custom("serialized tape refers to free variables"));
        }
        let num_operations = data.opcodes.iter().filter(|op| !op.is_structural()).count();
        let tape = Tape {
            opcodes: data.opcodes,
            arg_indices: data.arg_indices,
            results: data.results,
            constants: data.constants,
            worksize: data.worksize,
            num_operations,
            input_nnz: data.input_nnz,
            output_nnz: data.output_nnz,
            free_vars: Vec::new(),
        };
        let inputs_in_range = tape.elements().all(|el| {
            el.op != OpCode::Input
                || tape
                    .input_nnz
                    .get(el.arg[0] as usize)
                    .is_some_and(|&nnz| (el.arg[1] as usize) < nnz)
        });
        if !inputs_in_range || !tape.is_topologically_ordered() {
            return Err(serde::de::Error::custom("tape is not a valid topological order"));
        }
        Ok(tape)
    }
}
