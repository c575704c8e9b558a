use std::io::Write;

use itertools::Itertools;
use petgraph::visit::EdgeRef;

use super::{Built, Engine};

impl Engine<Built> {
    /// Renders the task graph in DOT for `--graph`. Edges are emitted
    /// sorted so the output is diffable.
    pub fn dot_graph<W: Write>(&self, mut writer: W) -> Result<(), std::io::Error> {
        writeln!(writer, "digraph {{")?;
        writeln!(writer, "\tcompound = \"true\"")?;
        writeln!(writer, "\tnewrank = \"true\"")?;

        let lines: Vec<String> = self
            .task_graph
            .edge_references()
            .map(|edge| {
                let source = &self.task_graph[edge.source()];
                let target = &self.task_graph[edge.target()];
                format!("\t\"[root] {source}\" -> \"[root] {target}\"")
            })
            .sorted()
            .collect();

        for line in lines {
            writeln!(writer, "{line}")?;
        }

        writeln!(writer, "}}")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::{engine::Engine, task_id::TaskId, turbo_json::TaskDefinition};

    #[test]
    fn test_dot_output() {
        let mut engine = Engine::new();
        let a = TaskId::new("a", "build").into_owned();
        let b = TaskId::new("b", "build").into_owned();
        let a_index = engine.get_index(&a);
        let b_index = engine.get_index(&b);
        engine.task_graph_mut().add_edge(a_index, b_index, ());
        engine.connect_to_root(&b);
        engine.add_definition(a, TaskDefinition::default());
        engine.add_definition(b, TaskDefinition::default());
        let engine = engine.seal();

        let mut out = Vec::new();
        engine.dot_graph(&mut out).unwrap();
        let rendered = String::from_utf8(out).unwrap();
        assert!(rendered.contains("\"[root] a#build\" -> \"[root] b#build\""), "{rendered}");
        assert!(rendered.starts_with("digraph {"), "{rendered}");
    }
}
