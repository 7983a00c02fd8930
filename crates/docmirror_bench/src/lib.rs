//! Benchmark utilities.

use docmirror_core::Document;
use rand::seq::SliceRandom;
use rand::Rng;

/// Zero-padded id so that string order matches numeric order.
pub fn doc_id(index: usize) -> String {
    format!("doc-{index:08}")
}

/// Generate `count` documents with a few typed fields, in random order.
pub fn generate_docs(count: usize) -> Vec<Document> {
    let mut rng = rand::thread_rng();
    let mut docs: Vec<Document> = (0..count)
        .map(|i| {
            Document::new(doc_id(i))
                .with_field("type", if i % 3 == 0 { "note" } else { "project" })
                .with_field("year", rng.gen_range(2000..2030))
                .with_field("tags", serde_json::json!(["a", "b"]))
        })
        .collect();
    docs.shuffle(&mut rng);
    docs
}
