use std::fs::File;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use hyperreal_core::{
    spawn_worker, Configuration, DeviceMap, EngineVariant, GenerationEngine, GenerationRequest,
    Loader, ModelLike, Orchestrator, OrchestratorError, OutputStore, SynthesisRequest,
};
use image::{DynamicImage, Rgb, RgbImage};

const CONFIG: &str = r#"
generation:
  model: dev
  defaults:
    width: 1024
    height: 1024
    steps: 28
    guidance: 3.5
    seed_max: 4294967295
models:
  dev:
    trigger_word: "HYPRRL"
styles:
  Style Zero:
    prompt: "{prompt}"
"#;

/// Returns a placeholder image whose colour is keyed by the seed.
struct Placeholder {
    seen: Arc<Mutex<Vec<SynthesisRequest>>>,
}

impl ModelLike for Placeholder {
    fn run(&mut self, request: &SynthesisRequest) -> Result<DynamicImage> {
        self.seen.lock().unwrap().push(request.clone());
        let seed = request.seed.unwrap_or(0);
        let pixel = Rgb([(seed % 256) as u8, (seed / 256 % 256) as u8, 0]);
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, pixel)))
    }
}

#[derive(Default)]
struct PlaceholderLoader {
    seen: Arc<Mutex<Vec<SynthesisRequest>>>,
}

impl Loader for PlaceholderLoader {
    type Model = Placeholder;

    fn load(&self, _variant: EngineVariant) -> Result<Placeholder> {
        Ok(Placeholder {
            seen: self.seen.clone(),
        })
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    seen: Arc<Mutex<Vec<SynthesisRequest>>>,
    engine: hyperreal_core::SharedEngine<PlaceholderLoader>,
}

fn fixture() -> Fixture {
    let loader = PlaceholderLoader::default();
    let seen = loader.seen.clone();
    let variant = EngineVariant::UnifiedMemory {
        device: DeviceMap::Metal(0),
    };
    Fixture {
        dir: tempfile::tempdir().unwrap(),
        seen,
        engine: GenerationEngine::new(variant, loader, "HYPRRL").into_shared(),
    }
}

fn orchestrator(fixture: &Fixture) -> Orchestrator<PlaceholderLoader> {
    Orchestrator::new(
        Arc::new(Configuration::from_yaml(CONFIG).unwrap()),
        fixture.engine.clone(),
        OutputStore::new(fixture.dir.path()),
    )
}

fn fox(seed: i64, batch_size: u32) -> GenerationRequest {
    GenerationRequest {
        style: Some("Style Zero".to_string()),
        width: Some(512),
        height: Some(512),
        steps: Some(4),
        guidance_scale: Some(3.5),
        seed,
        batch_size,
        ..GenerationRequest::new("a fox")
    }
}

#[tokio::test]
async fn end_to_end_batch_of_two() {
    let fixture = fixture();
    let (handle, _worker) = spawn_worker(orchestrator(&fixture)).unwrap();

    let result = handle.generate(fox(42, 2)).await.unwrap();

    assert_eq!(result.images.len(), 2);
    assert_eq!(result.seeds.as_slice(), &[42, 43]);
    assert_eq!(result.images[0].to_rgb8().get_pixel(0, 0), &Rgb([42, 0, 0]));
    assert_eq!(result.images[1].to_rgb8().get_pixel(0, 0), &Rgb([43, 0, 0]));

    let archive = result.archive.clone().expect("batch of two is archived");
    let zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
    let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
    names.sort();
    let expected: Vec<String> = result
        .paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, expected);
    assert_eq!(
        expected,
        vec![
            format!("gen_{}_0.png", result.batch_id),
            format!("gen_{}_1.png", result.batch_id)
        ]
    );

    let seen = fixture.seen.lock().unwrap();
    assert!(seen.iter().all(|r| r.prompt == "HYPRRL a fox"));
    assert!(result.info_text().ends_with("Seeds: [42, 43]"));
}

#[tokio::test]
async fn requests_run_in_submission_order() {
    let fixture = fixture();
    let (handle, _worker) = spawn_worker(orchestrator(&fixture)).unwrap();

    let pending: Vec<_> = [10, 20, 30]
        .into_iter()
        .map(|seed| handle.submit(fox(seed, 1)).unwrap())
        .collect();
    let mut batch_ids = Vec::new();
    for p in pending {
        batch_ids.push(p.wait().await.unwrap().batch_id);
    }

    let seeds: Vec<_> = fixture.seen.lock().unwrap().iter().map(|r| r.seed).collect();
    assert_eq!(seeds, vec![Some(10), Some(20), Some(30)]);
    batch_ids.sort();
    batch_ids.dedup();
    assert_eq!(batch_ids.len(), 3);
}

#[tokio::test]
async fn request_dropped_while_queued_never_reaches_the_engine() {
    let fixture = fixture();
    let (handle, _worker) = spawn_worker(orchestrator(&fixture)).unwrap();

    // Park the worker on the engine lock so the following jobs stay queued.
    let guard = fixture.engine.lock().unwrap();
    let first = handle.submit(fox(1, 1)).unwrap();
    let cancelled = handle.submit(fox(2, 1)).unwrap();
    let last = handle.submit(fox(3, 1)).unwrap();
    drop(cancelled);
    drop(guard);

    first.wait().await.unwrap();
    last.wait().await.unwrap();

    let seeds: Vec<_> = fixture.seen.lock().unwrap().iter().map(|r| r.seed).collect();
    assert_eq!(seeds, vec![Some(1), Some(3)]);
}

#[tokio::test]
async fn preload_goes_through_the_queue() {
    let fixture = fixture();
    let (handle, _worker) = spawn_worker(orchestrator(&fixture)).unwrap();
    handle.preload().await.unwrap();
    assert!(fixture.engine.lock().unwrap().is_loaded());
}

#[test]
fn worker_stops_when_handles_are_dropped() {
    let fixture = fixture();
    let (handle, worker) = spawn_worker(orchestrator(&fixture)).unwrap();
    let result = handle.submit(fox(5, 1)).unwrap().wait_blocking().unwrap();
    assert_eq!(result.seeds.as_slice(), &[5]);
    drop(handle);
    worker.join().unwrap();
}

#[tokio::test]
async fn invalid_requests_come_back_as_errors() {
    let fixture = fixture();
    let (handle, _worker) = spawn_worker(orchestrator(&fixture)).unwrap();
    let mut request = fox(1, 1);
    request.batch_size = 9;
    assert!(matches!(
        handle.generate(request).await,
        Err(OrchestratorError::InvalidRequest(_))
    ));
    assert!(handle.generate(fox(1, 1)).await.is_ok());
}
