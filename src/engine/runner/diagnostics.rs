use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;

use crate::engine::{NodeExecution, TaskNodeKey};
use crate::graph::DependencyDag;

/// Execution metrics of a task graph.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Every node of the executed graph, including those without edges.
    pub node_keys: Vec<TaskNodeKey>,
    /// Timing of every node that ran.
    pub execution_times: HashMap<TaskNodeKey, NodeExecution>,
}

impl Diagnostics {
    /// Renders the graph as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Never ran (skipped or canceled)
    ///
    /// Edges point from an input to the node consuming it.
    pub fn render_mermaid(&self, graph: &DependencyDag<TaskNodeKey>) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let keys: Vec<TaskNodeKey> = graph
            .dependency_graph()
            .nodes()
            .into_iter()
            .chain(self.node_keys.iter().cloned())
            .chain(self.execution_times.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let ids: HashMap<&TaskNodeKey, usize> = keys.iter().enumerate().map(|(i, k)| (k, i)).collect();

        let (min_time, max_time) = self.time_range();

        for (id, key) in keys.iter().enumerate() {
            let name = key.to_string().replace('"', "#quot;");

            let (label_extra, color_code) = match self.execution_times.get(key) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), gradient(t))
                }
                None => ("Skipped".to_string(), "#ADD8E6".to_string()),
            };

            let _ = writeln!(f, "    {id}[\"{name}\\n{label_extra}\"]");
            let _ = writeln!(f, "    style {id} fill:{color_code}");
        }

        for key in &keys {
            for dependency in graph.dependency_graph().children(key) {
                if let (Some(from), Some(to)) = (ids.get(dependency), ids.get(key)) {
                    let _ = writeln!(f, "    {from} --> {to}");
                }
            }
        }

        f
    }

    /// Shortest and longest node duration in seconds, never an empty range.
    fn time_range(&self) -> (f64, f64) {
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in self.execution_times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            // Nothing ran
            min_time = 0.0;
            max_time = 0.0;
        }

        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        (min_time, max_time)
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };
    format!("#{r:02X}{g:02X}{b:02X}")
}
