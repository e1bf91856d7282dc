use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use tracing::{error, info};

use crate::config::DEFAULT_STYLE;
use crate::style::{apply_style, resolve_style};
use crate::{
    new_batch_id, Configuration, EngineError, GenerationRequest, GenerationResult, ItemError,
    Loader, OrchestratorError, OutputStore, ResolvedSeedSet, SharedEngine,
};

/// Turns one request into a seeded, persisted and (for batches) archived set
/// of images. Every engine call made here holds the engine lock, so callers
/// sharing the same engine never overlap.
pub struct Orchestrator<L: Loader> {
    config: Arc<Configuration>,
    engine: SharedEngine<L>,
    store: OutputStore,
}

impl<L: Loader> Orchestrator<L> {
    pub fn new(config: Arc<Configuration>, engine: SharedEngine<L>, store: OutputStore) -> Self {
        Self {
            config,
            engine,
            store,
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Loads the models ahead of the first request.
    pub fn preload(&self) -> Result<(), EngineError> {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .load_models()
    }

    pub fn run(&self, request: &GenerationRequest) -> Result<GenerationResult, OrchestratorError> {
        let start = Instant::now();
        let defaults = &self.config.generation.defaults;

        let requested_style = request.style.as_deref().unwrap_or(DEFAULT_STYLE);
        let style = resolve_style(&self.config.styles, requested_style)?;
        let final_prompt = apply_style(&style.prompt, &request.prompt);

        let params = request.resolve(defaults)?;
        let seeds = ResolvedSeedSet::derive(
            request.seed,
            params.batch_size,
            defaults.seed_max,
            &mut rand::thread_rng(),
        )?;

        let batch_id = new_batch_id();
        let mut images = Vec::with_capacity(params.batch_size);
        let mut paths: Vec<PathBuf> = Vec::with_capacity(params.batch_size);
        let fail = |paths: &[PathBuf], source: ItemError| {
            error!("Batch {batch_id} stopped after {} item(s): {source}", paths.len());
            OrchestratorError::Batch {
                batch_id: batch_id.clone(),
                completed: paths.len(),
                persisted: paths.to_vec(),
                source,
            }
        };

        for (index, &seed) in seeds.as_slice().iter().enumerate() {
            info!(
                "Generating item {}/{} of batch {batch_id} with seed {seed}",
                index + 1,
                params.batch_size
            );
            let image = self
                .engine
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .generate(
                    &final_prompt,
                    &params.negative_prompt,
                    params.width,
                    params.height,
                    params.steps,
                    params.guidance,
                    seed,
                )
                .map_err(|e| fail(&paths, e.into()))?;
            let path = self
                .store
                .save_image(&batch_id, index, &image)
                .map_err(|e| fail(&paths, e.into()))?;
            images.push(image);
            paths.push(path);
        }

        let archive = if params.batch_size > 1 {
            Some(
                self.store
                    .write_archive(&batch_id, &paths)
                    .map_err(|e| fail(&paths, e.into()))?,
            )
        } else {
            None
        };

        let result = GenerationResult {
            images,
            seeds,
            elapsed: start.elapsed(),
            batch_id,
            paths,
            archive,
        };
        info!("{}", result.info_text());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::engine::tests::{stub_engine, StubLoader};
    use crate::{PersistError, StyleSpec};

    fn orchestrator(loader: StubLoader, dir: &std::path::Path) -> Orchestrator<StubLoader> {
        Orchestrator::new(
            Arc::new(sample()),
            stub_engine(loader).into_shared(),
            OutputStore::new(dir),
        )
    }

    fn request(seed: i64, batch_size: u32) -> GenerationRequest {
        GenerationRequest {
            style: Some("Cinematic".to_string()),
            width: Some(512),
            height: Some(512),
            steps: Some(4),
            guidance_scale: Some(3.5),
            seed,
            batch_size,
            ..GenerationRequest::new("a fox")
        }
    }

    #[test]
    fn single_item_has_no_archive() {
        let dir = tempfile::tempdir().unwrap();
        let result = orchestrator(StubLoader::default(), dir.path())
            .run(&request(7, 1))
            .unwrap();
        assert_eq!(result.images.len(), 1);
        assert_eq!(result.seeds.as_slice(), &[7]);
        assert!(result.archive.is_none());
        assert_eq!(
            result.paths,
            vec![dir.path().join(format!("gen_{}_0.png", result.batch_id))]
        );
    }

    #[test]
    fn style_and_trigger_reach_the_model_in_seed_order() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StubLoader::default();
        let result = orchestrator(loader.clone(), dir.path())
            .run(&request(100, 3))
            .unwrap();
        assert_eq!(result.seeds.as_slice(), &[100, 101, 102]);

        let seen = loader.seen.lock().unwrap();
        let seeds: Vec<_> = seen.iter().map(|r| r.seed).collect();
        assert_eq!(seeds, vec![Some(100), Some(101), Some(102)]);
        assert!(seen.iter().all(|r| r.prompt == "HYPRRL cinematic, a fox"));
        assert!(result.archive.unwrap().ends_with(format!("batch_{}.zip", result.batch_id)));
    }

    #[test]
    fn random_seeds_respect_seed_max() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(StubLoader::default(), dir.path());
        let result = orchestrator.run(&request(-1, 4)).unwrap();
        let seed_max = orchestrator.config().generation.defaults.seed_max;
        assert_eq!(result.seeds.len(), 4);
        assert!(result.seeds.as_slice().iter().all(|s| (0..=seed_max).contains(s)));
    }

    #[test]
    fn mid_batch_failure_keeps_earlier_items_and_skips_archive() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StubLoader {
            fail_at: Some(2),
            ..Default::default()
        };
        let err = orchestrator(loader, dir.path())
            .run(&request(10, 4))
            .unwrap_err();

        let OrchestratorError::Batch {
            batch_id,
            completed,
            persisted,
            source,
        } = err
        else {
            panic!("expected a batch failure");
        };
        assert_eq!(completed, 2);
        assert!(matches!(source, ItemError::Engine(EngineError::Generation(_))));
        assert_eq!(persisted.len(), 2);
        for index in 0..4 {
            let path = dir.path().join(format!("gen_{batch_id}_{index}.png"));
            assert_eq!(path.exists(), index < 2, "item {index}");
        }
        assert!(!dir.path().join(format!("batch_{batch_id}.zip")).exists());
    }

    #[test]
    fn save_failure_mid_batch_keeps_earlier_items_and_skips_archive() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_path_buf();
        // While item 1 renders, occupy its output name with a directory.
        let loader = StubLoader {
            after_run: Some(Arc::new(move |call: usize| {
                if call != 1 {
                    return;
                }
                let first = std::fs::read_dir(&out)
                    .unwrap()
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .find(|name| name.ends_with("_0.png"))
                    .unwrap();
                std::fs::create_dir(out.join(first.replace("_0.png", "_1.png"))).unwrap();
            })),
            ..Default::default()
        };
        let err = orchestrator(loader, dir.path())
            .run(&request(10, 3))
            .unwrap_err();

        let OrchestratorError::Batch {
            batch_id,
            completed,
            persisted,
            source,
        } = err
        else {
            panic!("expected a batch failure");
        };
        assert_eq!(completed, 1);
        assert!(matches!(
            source,
            ItemError::Persistence(PersistError::Image { .. })
        ));
        assert_eq!(persisted, vec![dir.path().join(format!("gen_{batch_id}_0.png"))]);
        assert!(persisted[0].is_file());
        assert!(!dir.path().join(format!("gen_{batch_id}_2.png")).exists());
        assert!(!dir.path().join(format!("batch_{batch_id}.zip")).exists());
    }

    #[test]
    fn failed_load_is_reported_per_request_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StubLoader::default();
        loader
            .failing_loads
            .store(1, std::sync::atomic::Ordering::SeqCst);
        let orchestrator = orchestrator(loader, dir.path());

        let err = orchestrator.run(&request(1, 2)).unwrap_err();
        assert_eq!(err.completed(), 0);
        assert!(matches!(
            err,
            OrchestratorError::Batch {
                source: ItemError::Engine(EngineError::ModelLoad(_)),
                ..
            }
        ));
        assert!(orchestrator.run(&request(1, 2)).is_ok());
    }

    #[test]
    fn missing_default_style_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample();
        config.styles.remove(DEFAULT_STYLE);
        config.styles.insert(
            "Only".to_string(),
            StyleSpec {
                prompt: "{prompt}".to_string(),
            },
        );
        let orchestrator = Orchestrator::new(
            Arc::new(config),
            stub_engine(StubLoader::default()).into_shared(),
            OutputStore::new(dir.path()),
        );
        let mut req = request(1, 1);
        req.style = Some("Cinematic".to_string());
        assert!(orchestrator.run(&req).is_ok());
        req.style = Some("Unknown".to_string());
        assert!(matches!(
            orchestrator.run(&req),
            Err(OrchestratorError::UnknownStyle { .. })
        ));
    }

    #[test]
    fn invalid_request_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StubLoader::default();
        let mut req = request(1, 1);
        req.width = Some(4096);
        assert!(matches!(
            orchestrator(loader.clone(), dir.path()).run(&req),
            Err(OrchestratorError::InvalidRequest(_))
        ));
        assert_eq!(loader.loads.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn preload_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StubLoader::default();
        let orchestrator = orchestrator(loader.clone(), dir.path());
        orchestrator.preload().unwrap();
        orchestrator.run(&request(1, 1)).unwrap();
        assert_eq!(loader.loads.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
