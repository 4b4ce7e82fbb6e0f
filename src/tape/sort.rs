//! Graph sorting and work-array register allocation.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::function::TopologicalSorting;
use crate::matrix::SxMatrix;
use crate::opcode::{self, OpCode};
use crate::sx::Sx;

use super::Tape;

/// Node of the sorted graph: an expression, or the store of an output
/// nonzero whose expression sits at `pos`.
enum Node {
    Expr(Sx),
    Output { index: usize, nz: usize, pos: usize },
}

/// Depth-first topological sort from every output nonzero.
///
/// Of the unvisited operands of a node, the one with the most operands of
/// its own is descended into first, so leaves are emitted late and close to
/// their consumers. Output stores follow output-major, then nonzero order.
///
/// Returns the sorted nodes and the position of every expression node,
/// keyed by [`Sx::id`].
fn sort_nodes(outputs: &[SxMatrix]) -> (Vec<Node>, HashMap<usize, usize>) {
    let mut position: HashMap<usize, usize> = HashMap::new();
    let mut order: Vec<Node> = Vec::new();
    let mut stack: Vec<Sx> = Vec::new();

    for (index, m) in outputs.iter().enumerate() {
        for (nz, e) in m.data().iter().enumerate() {
            stack.push(e.clone());
            while let Some(top) = stack.last().cloned() {
                if position.contains_key(&top.id()) {
                    stack.pop();
                    continue;
                }
                let mut next: Option<&Sx> = None;
                for d in top.deps() {
                    if position.contains_key(&d.id()) {
                        continue;
                    }
                    if next.map_or(true, |n| d.ndeps() > n.ndeps()) {
                        next = Some(d);
                    }
                }
                match next {
                    Some(child) => stack.push(child.clone()),
                    None => {
                        stack.pop();
                        position.insert(top.id(), order.len());
                        order.push(Node::Expr(top));
                    }
                }
            }
            order.push(Node::Output {
                index,
                nz,
                pos: position[&e.id()],
            });
        }
    }
    (order, position)
}

/// Stable re-sort of a depth-first order by level.
///
/// Leaves are level 0 and an operation sits one level above its deepest
/// operand, so no operation depends on another of its own level. Output
/// stores go last, in their original order.
fn resort_breadth_first(nodes: Vec<Node>) -> (Vec<Node>, HashMap<usize, usize>) {
    let n = nodes.len();
    let mut level = vec![0usize; n];
    let mut level_of: HashMap<usize, usize> = HashMap::new();
    let mut nlevels = 1;
    for (i, node) in nodes.iter().enumerate() {
        if let Node::Expr(e) = node {
            let l = e.deps().iter().map(|d| level_of[&d.id()] + 1).max().unwrap_or(0);
            level_of.insert(e.id(), l);
            level[i] = l;
            nlevels = nlevels.max(l + 1);
        }
    }
    for (i, node) in nodes.iter().enumerate() {
        if let Node::Output { .. } = node {
            level[i] = nlevels;
        }
    }

    // counting sort, stable within a level
    let mut next = vec![0usize; nlevels + 2];
    for &l in &level {
        next[l + 1] += 1;
    }
    for l in 0..=nlevels {
        next[l + 1] += next[l];
    }
    let mut new_index = vec![0usize; n];
    for (i, &l) in level.iter().enumerate() {
        new_index[i] = next[l];
        next[l] += 1;
    }
    let mut slots: Vec<Option<Node>> = (0..n).map(|_| None).collect();
    for (i, node) in nodes.into_iter().enumerate() {
        slots[new_index[i]] = Some(node);
    }
    let mut sorted: Vec<Node> = slots.into_iter().flatten().collect();

    let mut position = HashMap::with_capacity(n);
    for (i, node) in sorted.iter_mut().enumerate() {
        match node {
            Node::Expr(e) => {
                position.insert(e.id(), i);
            }
            Node::Output { pos, .. } => *pos = new_index[*pos],
        }
    }
    log::debug!("breadth-first resort: {nlevels} level(s) over {n} elements");
    (sorted, position)
}

impl Tape {
    /// Sort the graph reaching `outputs` into a tape over `inputs`.
    ///
    /// Every input nonzero must be a distinct symbol. Symbols reached from
    /// the outputs that are not inputs become free variables
    /// ([`Tape::free_variables`]); such a tape can be inspected and
    /// evaluated symbolically but refuses numeric evaluation.
    ///
    /// With `live_variables`, a work-array slot is reused as soon as the
    /// last consumer of its value has executed (most recently freed first);
    /// otherwise every value gets its own slot.
    pub fn from_graph(inputs: &[SxMatrix], outputs: &[SxMatrix], live_variables: bool) -> Result<Tape> {
        Self::from_graph_with(inputs, outputs, live_variables, TopologicalSorting::DepthFirst)
    }

    /// [`from_graph`](Self::from_graph) with a choice of operation order.
    pub fn from_graph_with(
        inputs: &[SxMatrix],
        outputs: &[SxMatrix],
        live_variables: bool,
        sorting: TopologicalSorting,
    ) -> Result<Tape> {
        let mut input_of: HashMap<usize, (u32, u32)> = HashMap::new();
        for (i, m) in inputs.iter().enumerate() {
            for (k, e) in m.data().iter().enumerate() {
                if !e.is_symbolic() || input_of.insert(e.id(), (i as u32, k as u32)).is_some() {
                    return Err(Error::InvalidInput { index: i, nz: k });
                }
            }
        }

        let (nodes, position) = match sorting {
            TopologicalSorting::DepthFirst => sort_nodes(outputs),
            TopologicalSorting::BreadthFirst => resort_breadth_first(sort_nodes(outputs).0),
        };
        let n = nodes.len();

        let mut opcodes = Vec::with_capacity(n);
        let mut arg_indices: Vec<[u32; 2]> = Vec::with_capacity(n);
        let mut results: Vec<u32> = Vec::with_capacity(n);
        let mut constants = Vec::with_capacity(n);
        let mut free_vars = Vec::new();

        // Operands are node positions until register allocation below.
        for (pos, node) in nodes.iter().enumerate() {
            let (op, arg, res, value) = match node {
                Node::Output { index, nz, pos } => {
                    (OpCode::Output, [*pos as u32, *nz as u32], *index as u32, 0.0)
                }
                Node::Expr(e) => match e.op() {
                    OpCode::Const => (OpCode::Const, [0, 0], pos as u32, e.value().unwrap_or(0.0)),
                    OpCode::Parameter => match input_of.get(&e.id()) {
                        Some(&(i, k)) => (OpCode::Input, [i, k], pos as u32, 0.0),
                        None => {
                            free_vars.push(e.clone());
                            let idx = (free_vars.len() - 1) as u32;
                            (OpCode::Parameter, [idx, 0], pos as u32, 0.0)
                        }
                    },
                    op => {
                        let deps: Vec<u32> =
                            e.deps().iter().map(|d| position[&d.id()] as u32).collect();
                        let arg = match deps.as_slice() {
                            [a] => [*a, *a],
                            [a, b] => [*a, *b],
                            _ => unreachable!("operations have one or two operands"),
                        };
                        (op, arg, pos as u32, 0.0)
                    }
                },
            };
            opcodes.push(op);
            arg_indices.push(arg);
            results.push(res);
            constants.push(value);
        }

        let worksize = allocate_registers(&opcodes, &mut arg_indices, &mut results, live_variables);
        let num_operations = opcodes.iter().filter(|op| !op.is_structural()).count();

        log::debug!(
            "sorted {} elements ({} operations, {}), work array {} (live_variables={})",
            n,
            num_operations,
            sorting,
            worksize,
            live_variables
        );
        if !free_vars.is_empty() {
            log::debug!("{} free variable(s) after sorting", free_vars.len());
        }

        Ok(Tape {
            opcodes,
            arg_indices,
            results,
            constants,
            worksize,
            num_operations,
            input_nnz: inputs.iter().map(|m| m.nnz()).collect(),
            output_nnz: outputs.iter().map(|m| m.nnz()).collect(),
            free_vars,
        })
    }
}

/// Map node positions to work-array slots. Returns the work-array size.
fn allocate_registers(
    opcodes: &[OpCode],
    arg_indices: &mut [[u32; 2]],
    results: &mut [u32],
    live_variables: bool,
) -> usize {
    let n = opcodes.len();
    let mut refcount = vec![0u32; n];
    for (i, &op) in opcodes.iter().enumerate() {
        for c in 0..opcode::ndeps(op) {
            refcount[arg_indices[i][c] as usize] += 1;
        }
    }

    let mut place = vec![0u32; n];
    let mut unused: Vec<u32> = Vec::new();
    let mut worksize = 0u32;

    for i in 0..n {
        let op = opcodes[i];
        let nd = opcode::ndeps(op);

        for c in (0..nd).rev() {
            let ch = arg_indices[i][c] as usize;
            refcount[ch] -= 1;
            if refcount[ch] == 0 {
                unused.push(place[ch]);
            }
        }

        if op != OpCode::Output {
            let reused = if live_variables { unused.pop() } else { None };
            let slot = reused.unwrap_or_else(|| {
                worksize += 1;
                worksize - 1
            });
            place[i] = slot;
            results[i] = slot;
        }

        for c in 0..nd {
            arg_indices[i][c] = place[arg_indices[i][c] as usize];
        }
        if nd == 1 && op != OpCode::Output {
            arg_indices[i][1] = arg_indices[i][0];
        }
    }
    worksize as usize
}
