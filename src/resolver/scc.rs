//! Tarjan's strongly connected components over index-based adjacency lists.

/// Find all strongly connected components.
///
/// Components are returned in the order Tarjan's algorithm completes them;
/// nodes are visited in index order and successors in adjacency order, so the
/// result is deterministic.
pub fn strongly_connected(adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut tarjan = Tarjan::new(adjacency);
    for node in 0..adjacency.len() {
        if tarjan.indices[node].is_none() {
            tarjan.strongconnect(node);
        }
    }
    tarjan.sccs
}

/// Components that contain a cycle: more than one node, or a self-loop
pub fn cyclic_components(adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    strongly_connected(adjacency)
        .into_iter()
        .filter(|scc| scc.len() > 1 || adjacency[scc[0]].contains(&scc[0]))
        .map(|mut scc| {
            scc.sort_unstable();
            scc
        })
        .collect()
}

struct Tarjan<'a> {
    adjacency: &'a [Vec<usize>],
    index_counter: usize,
    stack: Vec<usize>,
    on_stack: Vec<bool>,
    indices: Vec<Option<usize>>,
    lowlinks: Vec<usize>,
    sccs: Vec<Vec<usize>>,
}

impl<'a> Tarjan<'a> {
    fn new(adjacency: &'a [Vec<usize>]) -> Self {
        let n = adjacency.len();
        Self {
            adjacency,
            index_counter: 0,
            stack: Vec::new(),
            on_stack: vec![false; n],
            indices: vec![None; n],
            lowlinks: vec![0; n],
            sccs: Vec::new(),
        }
    }

    fn strongconnect(&mut self, v: usize) {
        self.indices[v] = Some(self.index_counter);
        self.lowlinks[v] = self.index_counter;
        self.index_counter += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        let adjacency = self.adjacency;
        for &w in &adjacency[v] {
            match self.indices[w] {
                None => {
                    self.strongconnect(w);
                    self.lowlinks[v] = self.lowlinks[v].min(self.lowlinks[w]);
                }
                Some(w_index) if self.on_stack[w] => {
                    self.lowlinks[v] = self.lowlinks[v].min(w_index);
                }
                Some(_) => {}
            }
        }

        // Root of a component: pop it off the stack
        if Some(self.lowlinks[v]) == self.indices[v] {
            let mut scc = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                scc.push(w);
                if w == v {
                    break;
                }
            }
            self.sccs.push(scc);
        }
    }
}
