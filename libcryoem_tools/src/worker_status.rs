/// Progress message sent from a batch worker to the UI thread.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub completed: usize,
    pub total: usize,
    pub task: String,
}

impl WorkerStatus {
    pub fn new(completed: usize, total: usize, task: &str) -> Self {
        let progress = if total == 0 {
            1.0
        } else {
            completed as f32 / total as f32
        };
        Self {
            progress,
            completed,
            total,
            task: task.to_string(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completed >= self.total
    }
}
