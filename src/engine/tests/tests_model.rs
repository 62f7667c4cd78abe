//! Random operation sequences checked against a `BTreeMap` model, with
//! flushes, compaction passes, and reopens mixed in.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::engine::tests::helpers::*;
    use crate::engine::{Engine, EngineConfig};
    use tempfile::TempDir;

    fn model_config() -> EngineConfig {
        EngineConfig {
            write_buffer_size: 128,
            compaction_threshold: 3,
            ..small_buffer_config()
        }
    }

    fn check(engine: &Engine, model: &BTreeMap<String, String>, keys: &[String]) {
        for key in keys {
            assert_eq!(
                engine.read(key).unwrap().as_ref(),
                model.get(key),
                "key {key}"
            );
        }
    }

    #[test]
    fn test_random_ops_match_model() {
        let tmp = TempDir::new().unwrap();
        let mut rng = StdRng::seed_from_u64(0x7133_4b76);
        let keys: Vec<String> = (0..40).map(|i| format!("key{i:02}")).collect();
        let mut model = BTreeMap::new();
        let mut engine = Engine::open(tmp.path(), model_config()).unwrap();

        for step in 0..2_000 {
            let key = &keys[rng.random_range(0..keys.len())];
            match rng.random_range(0..10) {
                0..=3 => {
                    let value = format!("i{step}");
                    engine.insert(key, &value).unwrap();
                    model.insert(key.clone(), value);
                }
                4..=6 => {
                    let value = format!("u{step}");
                    engine.update(key, &value).unwrap();
                    model.insert(key.clone(), value);
                }
                7..=8 => {
                    engine.delete(key).unwrap();
                    model.remove(key);
                }
                _ => {
                    engine.compact_if_needed().unwrap();
                }
            }

            if step % 500 == 499 {
                drop(engine);
                engine = reopen(tmp.path(), model_config());
            }
            if step % 100 == 0 {
                check(&engine, &model, &keys);
            }
        }
        check(&engine, &model, &keys);
    }
}
