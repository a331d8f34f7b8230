#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use storyline_pipeline::{Document, Stage, StageRegistry};

pub fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

/// Stage writing `{ <lowercased name>: true }`
pub struct Flag(pub String);

#[async_trait]
impl Stage for Flag {
    fn name(&self) -> &str {
        &self.0
    }

    async fn process(&self, _story: &Document) -> anyhow::Result<Document> {
        let mut out = Document::new();
        out.insert(self.0.to_lowercase(), Value::Bool(true));
        Ok(out)
    }
}

pub fn flag_registry<I, S>(names: I) -> Arc<StageRegistry>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut registry = StageRegistry::new();
    for name in names {
        registry.register(Arc::new(Flag(name.into())));
    }
    Arc::new(registry)
}
