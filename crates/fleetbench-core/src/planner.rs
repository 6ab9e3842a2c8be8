//! Task planner: groups benchmark tasks onto VMs by resource affinity.

use crate::{BenchmarkTask, ExecutionGroup};

/// Groups a flat task list into execution groups.
///
/// Every input task must appear in exactly one output group.
pub trait Planner: Send + Sync {
    fn plan(&self, tasks: Vec<BenchmarkTask>) -> Vec<ExecutionGroup>;
}

/// Groups tasks by (model, GPU model).
///
/// Tasks for the same model on the same GPU type share a VM so model weights
/// stay cached across GPU-count variants. Within a group tasks run in
/// descending GPU count order, and the group provisions the largest count.
///
/// With `gpu_concurrency > 1` each (model, GPU) group is split round-robin
/// into up to that many sub-groups, each on its own VM.
#[derive(Debug, Clone)]
pub struct GroupByModelAndGpu {
    gpu_concurrency: usize,
}

impl GroupByModelAndGpu {
    pub fn new() -> Self {
        Self { gpu_concurrency: 1 }
    }

    /// Split each (model, GPU) group across up to `n` VMs.
    pub fn with_gpu_concurrency(mut self, n: usize) -> Self {
        self.gpu_concurrency = n.max(1);
        self
    }
}

impl Default for GroupByModelAndGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Planner for GroupByModelAndGpu {
    fn plan(&self, tasks: Vec<BenchmarkTask>) -> Vec<ExecutionGroup> {
        // Keyed groups in first-seen order.
        let mut keyed: Vec<((String, String), Vec<BenchmarkTask>)> = Vec::new();
        for task in tasks {
            let key = (task.model_name().to_string(), task.gpu_name.clone());
            match keyed.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(task),
                None => keyed.push((key, vec![task])),
            }
        }

        let mut groups = Vec::new();
        for ((_model, gpu_name), mut members) in keyed {
            // Stable: equal counts keep submission order.
            members.sort_by(|a, b| b.gpu_count.cmp(&a.gpu_count));

            let splits = self.gpu_concurrency.min(members.len());
            if splits <= 1 {
                groups.push(make_group(gpu_name, members, None));
                continue;
            }

            let mut subs: Vec<Vec<BenchmarkTask>> = (0..splits).map(|_| Vec::new()).collect();
            for (i, task) in members.into_iter().enumerate() {
                subs[i % splits].push(task);
            }
            for (idx, sub) in subs.into_iter().enumerate() {
                if !sub.is_empty() {
                    groups.push(make_group(gpu_name.clone(), sub, Some(idx + 1)));
                }
            }
        }
        groups
    }
}

fn make_group(
    gpu_name: String,
    tasks: Vec<BenchmarkTask>,
    split_index: Option<usize>,
) -> ExecutionGroup {
    let gpu_count = tasks.iter().map(|t| t.gpu_count).max().unwrap_or(1);
    ExecutionGroup {
        gpu_name,
        gpu_count,
        tasks,
        split_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Recipe;
    use std::collections::HashSet;

    fn task(index: usize, model: &str, gpu: &str, gpu_count: u32) -> BenchmarkTask {
        let mut recipe = Recipe::default();
        recipe.model.huggingface = model.to_string();
        BenchmarkTask::new(
            index,
            format!("recipes/r{}", index),
            format!("v{}", index),
            recipe,
            gpu,
            gpu_count,
            "/tmp/run",
        )
    }

    const RTX: &str = "NVIDIA GeForce RTX 5090";
    const H100: &str = "NVIDIA H100 80GB";

    #[test]
    fn test_one_and_four_gpu_tasks_share_a_group() {
        let tasks = vec![task(0, "m", RTX, 1), task(1, "m", RTX, 4)];
        let groups = GroupByModelAndGpu::new().plan(tasks);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].gpu_count, 4);
        let order: Vec<u32> = groups[0].tasks.iter().map(|t| t.gpu_count).collect();
        assert_eq!(order, vec![4, 1]);
    }

    #[test]
    fn test_every_task_planned_exactly_once() {
        let tasks = vec![
            task(0, "a", RTX, 1),
            task(1, "b", RTX, 2),
            task(2, "a", H100, 8),
            task(3, "a", RTX, 2),
            task(4, "b", RTX, 1),
            task(5, "a", H100, 1),
        ];
        let groups = GroupByModelAndGpu::new().plan(tasks);

        let mut seen = HashSet::new();
        let mut total = 0;
        for group in &groups {
            let max = group.tasks.iter().map(|t| t.gpu_count).max().unwrap();
            assert_eq!(group.gpu_count, max);
            for t in &group.tasks {
                assert_eq!(t.gpu_name, group.gpu_name);
                assert_eq!(t.model_name(), group.tasks[0].model_name());
                assert!(seen.insert(t.index));
                total += 1;
            }
        }
        assert_eq!(total, 6);
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn test_different_models_get_separate_groups() {
        let tasks = vec![task(0, "a", RTX, 1), task(1, "b", RTX, 1)];
        let groups = GroupByModelAndGpu::new().plan(tasks);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_equal_counts_keep_submission_order() {
        let tasks = vec![
            task(0, "a", RTX, 2),
            task(1, "a", RTX, 2),
            task(2, "a", RTX, 2),
        ];
        let groups = GroupByModelAndGpu::new().plan(tasks);
        let order: Vec<usize> = groups[0].tasks.iter().map(|t| t.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_gpu_concurrency_splits_round_robin() {
        let tasks = vec![
            task(0, "a", RTX, 1),
            task(1, "a", RTX, 4),
            task(2, "a", RTX, 2),
        ];
        let groups = GroupByModelAndGpu::new()
            .with_gpu_concurrency(2)
            .plan(tasks);

        assert_eq!(groups.len(), 2);
        let first: Vec<u32> = groups[0].tasks.iter().map(|t| t.gpu_count).collect();
        let second: Vec<u32> = groups[1].tasks.iter().map(|t| t.gpu_count).collect();
        assert_eq!(first, vec![4, 1]);
        assert_eq!(second, vec![2]);
        assert_eq!(groups[0].gpu_count, 4);
        assert_eq!(groups[1].gpu_count, 2);
        assert_eq!(groups[0].split_index, Some(1));
        assert_eq!(groups[1].split_index, Some(2));
    }

    #[test]
    fn test_gpu_concurrency_capped_by_group_size() {
        let tasks = vec![task(0, "a", RTX, 1)];
        let groups = GroupByModelAndGpu::new()
            .with_gpu_concurrency(4)
            .plan(tasks);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].split_index, None);
    }

    #[test]
    fn test_empty_input() {
        assert!(GroupByModelAndGpu::new().plan(Vec::new()).is_empty());
    }
}
