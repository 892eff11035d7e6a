use crate::model::{DerivedDefinition, Metric};
use crate::StoreError;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// DAG over metrics: an edge runs from every input to the derived metric consuming it.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    definitions: BTreeMap<String, DerivedDefinition>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Validates inputs and arity and orders derived metrics so each one follows all of its inputs.
    /// Ties are broken by metric id so the order is stable across runs.
    pub fn build(metrics: &[Metric]) -> Result<Self, StoreError> {
        let known: BTreeSet<&str> = metrics.iter().map(|m| m.metric_id.as_str()).collect();
        let mut definitions = BTreeMap::new();
        for metric in metrics {
            if let Some(def) = metric.definition() {
                def.combinator.check_arity(def.inputs.len())
                    .map_err(|e| StoreError::config(format!("metric {}: {}", metric.metric_id, e)))?;
                for input in &def.inputs {
                    if input == &metric.metric_id {
                        return Err(StoreError::config(format!("metric {} depends on itself", metric.metric_id)));
                    }
                    if !known.contains(input.as_str()) {
                        return Err(StoreError::config(format!("metric {} depends on unregistered metric {}", metric.metric_id, input)));
                    }
                }
                definitions.insert(metric.metric_id.clone(), def.clone());
            }
        }

        // Kahn's algorithm restricted to derived nodes, base inputs are always satisfied
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (id, def) in &definitions {
            let derived_inputs: BTreeSet<&str> = def.inputs.iter().map(String::as_str).filter(|i| definitions.contains_key(*i)).collect();
            pending.insert(id.as_str(), derived_inputs.len());
            for input in derived_inputs {
                dependents.entry(input).or_default().push(id.as_str());
            }
        }
        let mut ready: VecDeque<&str> = pending.iter().filter(|(_, n)| **n == 0).map(|(id, _)| *id).collect();
        let mut order = Vec::with_capacity(definitions.len());
        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            let mut unlocked = Vec::new();
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(n) = pending.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        unlocked.push(*dependent);
                    }
                }
            }
            unlocked.sort_unstable();
            ready.extend(unlocked);
        }

        if order.len() != definitions.len() {
            let cyclic: Vec<&str> = pending.into_iter().filter(|(_, n)| *n > 0).map(|(id, _)| id).collect();
            return Err(StoreError::config(format!("dependency cycle among derived metrics: {}", cyclic.join(", "))));
        }
        Ok(Self { definitions, order })
    }

    /// Derived metric ids, every metric after all of its inputs.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn definition(&self, metric_id: &str) -> Option<&DerivedDefinition> {
        self.definitions.get(metric_id)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Derived metrics reachable from any of the given metrics, in recompute order.
    pub fn downstream_of(&self, metric_ids: &BTreeSet<String>) -> Vec<String> {
        let mut affected: BTreeSet<&str> = metric_ids.iter().map(String::as_str).collect();
        let mut out = Vec::new();
        for id in &self.order {
            let def = &self.definitions[id];
            if def.inputs.iter().any(|i| affected.contains(i.as_str())) {
                affected.insert(id.as_str());
                out.push(id.clone());
            }
        }
        out
    }
}
