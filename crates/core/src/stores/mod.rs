pub mod file_index;

pub use file_index::{cosine_similarity, FileVectorIndex};
