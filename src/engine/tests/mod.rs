pub mod helpers;
mod tests_compaction;
mod tests_flush;

// Randomized comparison against an in-memory model
mod tests_model;
