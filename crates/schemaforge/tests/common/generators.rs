//! Stand-in generators for exercising the pipeline without an external
//! code generator.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use schemaforge::{GenerationError, Generator};

/// Writes a small TypeScript tree derived from the schema contents.
pub fn typescript_client() -> Arc<dyn Generator> {
    Arc::new(|input: &Path, output: &Path| -> Result<(), GenerationError> {
        let schema = std::fs::read_to_string(input)
            .map_err(|e| GenerationError::new(format!("cannot read schema: {}", e)))?;
        let models: Vec<&str> = schema
            .lines()
            .filter_map(|line| line.trim().strip_prefix("model "))
            .filter_map(|rest| rest.split_whitespace().next())
            .collect();

        let io = |e: std::io::Error| GenerationError::new(e.to_string());
        std::fs::create_dir_all(output.join("models")).map_err(io)?;
        for model in &models {
            std::fs::write(
                output.join("models").join(format!("{}.ts", model)),
                format!("export interface {} {{}}\n", model),
            )
            .map_err(io)?;
        }
        std::fs::write(output.join("index.ts"), format!("// {} models\n", models.len()))
            .map_err(io)
    })
}

/// Always fails with `message`.
pub fn failing(message: &'static str) -> Arc<dyn Generator> {
    Arc::new(move |_: &Path, _: &Path| -> Result<(), GenerationError> {
        Err(GenerationError::new(message))
    })
}

/// Panics on every call and counts the calls.
pub fn crashing(calls: Arc<AtomicUsize>) -> Arc<dyn Generator> {
    Arc::new(move |_: &Path, _: &Path| -> Result<(), GenerationError> {
        calls.fetch_add(1, Ordering::SeqCst);
        panic!("generator process died");
    })
}

/// Sleeps before delegating to [`typescript_client`].
pub fn slow(delay: Duration) -> Arc<dyn Generator> {
    let inner = typescript_client();
    Arc::new(move |input: &Path, output: &Path| -> Result<(), GenerationError> {
        std::thread::sleep(delay);
        inner.generate(input, output)
    })
}
