
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::core::config::Config;
use crate::core::queue::DurableQueue;
use crate::core::scheduler::ActionContext;

fn write_task(dir: &Path, file: &str, task: Value) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join(file),
        serde_json::to_vec_pretty(&task).unwrap(),
    )
    .unwrap();
}

fn read_task(dir: &Path, file: &str) -> Value {
    serde_json::from_str(&std::fs::read_to_string(dir.join(file)).unwrap()).unwrap()
}

fn context(root: &Path) -> ActionContext {
    ActionContext {
        queue: DurableQueue::new(root.join("queue")),
        config: Arc::new(Config::default()),
    }
}
