//! Asynchronous OCR jobs.
//!
//! [`JobOrchestrator::submit`] stores the upload, queues the job and returns
//! right away. A background worker runs the [`DocumentPipeline`] and leaves
//! exactly one terminal artifact in the job's workspace. Status is always read
//! back from the workspace, never from memory, so it survives restarts.

use std::{collections::HashMap, sync::Arc};

use futures::FutureExt as _;

use crate::{
    async_utils::JoinWorker,
    error::JobError,
    ocr::{OcrOptions, pool::EnginePool},
    pipeline::DocumentPipeline,
    prelude::*,
};

use self::{
    queue::{JobFn, JobQueue},
    workspace::{JobId, JobManifest, JobStore, Workspace},
};

pub mod form;
pub mod queue;
pub mod workspace;

pub use self::workspace::JobStatus;

/// A job waiting for a worker.
pub struct QueuedJob {
    workspace: Workspace,
    options: OcrOptions,
}

/// Runs queued jobs and records their outcome.
pub struct JobRunner {
    pipeline: DocumentPipeline,
    pool: EnginePool,
}

impl JobRunner {
    pub fn new(pipeline: DocumentPipeline, pool: EnginePool) -> Self {
        Self { pipeline, pool }
    }

    /// Run one job to completion and write its terminal artifact.
    ///
    /// This never fails. Pipeline errors become `error.txt`, and if we can't
    /// even write that, we log it.
    #[instrument(level = "info", skip_all, fields(id = %job.workspace.id()))]
    pub async fn run_job(&self, job: QueuedJob) {
        let QueuedJob { workspace, options } = job;
        let engine = self.pool.engine_for(&options.languages);
        debug!(reused_engine = engine.is_some(), "Starting OCR job");

        // Run the pipeline in its own task, so that a panic becomes a failed
        // job instead of a job that is processing forever.
        let pipeline = self.pipeline.clone();
        let document_path = workspace.document_path();
        let outcome = tokio::spawn(async move {
            pipeline.run(&document_path, &options, engine, None).await
        })
        .await;

        let written = match outcome {
            Ok(Ok(result)) => {
                debug!(pages = result.len(), "OCR pipeline finished");
                record_result(&workspace, move |ws| ws.write_result(&result)).await
            }
            Ok(Err(err)) => {
                warn!("OCR job failed: {}", err);
                write_error(&workspace, err.to_string()).await
            }
            Err(join_err) => {
                error!("OCR job crashed: {}", join_err);
                write_error(&workspace, format!("internal error: {}", join_err)).await
            }
        };
        if let Err(err) = written {
            error!("could not record job outcome: {:#}", err);
        }
    }
}

/// Write `ocr.json` off the async executor using `write`. If that fails, we
/// fall back to `error.txt`, so the job never looks busy forever.
async fn record_result<W>(workspace: &Workspace, write: W) -> Result<()>
where
    W: FnOnce(&Workspace) -> Result<()> + Send + 'static,
{
    let ws = workspace.clone();
    let written = tokio::task::spawn_blocking(move || write(&ws))
        .await
        .context("result writer panicked")
        .and_then(|r| r);
    match written {
        Ok(()) => {
            info!("OCR job finished");
            Ok(())
        }
        Err(err) => {
            error!("could not save OCR result: {:#}", err);
            write_error(workspace, format!("could not save OCR result: {:#}", err)).await
        }
    }
}

/// Write `error.txt` off the async executor.
async fn write_error(workspace: &Workspace, message: String) -> Result<()> {
    let ws = workspace.clone();
    tokio::task::spawn_blocking(move || ws.write_error(&message))
        .await
        .context("error writer panicked")?
}

/// Accepts uploads and reports on jobs.
pub struct JobOrchestrator {
    store: JobStore,
    queue: JobQueue<QueuedJob>,
}

impl JobOrchestrator {
    /// Start `workers` background workers with room for `capacity` waiting
    /// jobs.
    ///
    /// To shut down cleanly, drop the orchestrator and then wait on the
    /// returned [`JoinWorker`]; queued jobs will be finished first.
    pub fn start(
        store: JobStore,
        runner: JobRunner,
        workers: usize,
        capacity: usize,
    ) -> (Self, JoinWorker) {
        let runner = Arc::new(runner);
        let job_fn: JobFn<QueuedJob> = Arc::new(move |job| {
            let runner = runner.clone();
            async move { runner.run_job(job).await }.boxed()
        });
        let (queue, worker) = JobQueue::start(workers, capacity, job_fn);
        (Self { store, queue }, worker)
    }

    #[cfg(test)]
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Accept an upload. Returns as soon as the document is on disk and the
    /// job is queued.
    #[instrument(level = "debug", skip_all)]
    pub fn submit(
        &self,
        document: Option<&[u8]>,
        filename: Option<&str>,
        options: OcrOptions,
    ) -> Result<JobId, JobError> {
        let document = match document {
            Some(document) if !document.is_empty() => document,
            _ => return Err(JobError::Validation("missing file".to_owned())),
        };
        let manifest = JobManifest {
            original_filename: form::sanitize_filename(filename),
            options,
        };
        let workspace = self.store.create(document, &manifest)?;
        let id = workspace.id().clone();
        let job = QueuedJob {
            workspace,
            options: manifest.options,
        };
        if let Err((err, job)) = self.queue.try_submit(job) {
            warn!(%id, "Could not queue job: {}", err);
            self.store.remove(&job.workspace);
            return Err(err);
        }
        info!(%id, filename = %manifest.original_filename, "Queued OCR job");
        Ok(id)
    }

    /// Accept an upload with options taken from form fields.
    pub fn submit_form(
        &self,
        document: Option<&[u8]>,
        filename: Option<&str>,
        fields: &HashMap<String, String>,
    ) -> Result<JobId, JobError> {
        self.submit(document, filename, form::options_from_form(fields))
    }

    /// What state is job `id` in?
    pub fn status(&self, id: &str) -> Result<JobStatus, JobError> {
        self.store.status(id)
    }

    /// Path of the uploaded document, if the job exists.
    pub fn document_path(&self, id: &str) -> Option<PathBuf> {
        let id = id.parse::<JobId>().ok()?;
        Some(self.store.open(&id).document_path()).filter(|p| p.is_file())
    }

    /// Path of the result artifact, if the job has finished successfully.
    pub fn result_path(&self, id: &str) -> Option<PathBuf> {
        let id = id.parse::<JobId>().ok()?;
        Some(self.store.open(&id).result_path()).filter(|p| p.is_file())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{str::FromStr as _, time::Duration};

    use tokio::sync::Semaphore;

    use super::*;
    use crate::{
        ocr::{LanguageSet, engines::OcrEngine, normalize::RawDetection},
        testing::{CountingFactory, FAKE_PDF, FakeRasterizer, ScriptedEngine},
    };

    /// Everything a test needs to poke at an orchestrator.
    pub(crate) struct Harness {
        pub orchestrator: Arc<JobOrchestrator>,
        pub worker: JoinWorker,
        pub factory: Arc<CountingFactory>,
        pub _dir: tempfile::TempDir,
    }

    /// An orchestrator over a fake 3-page document. The pre-warmed engine (for
    /// `en`) sees one good detection on page 1.
    pub(crate) async fn harness(gate: Option<Arc<Semaphore>>) -> Harness {
        let mut engine = ScriptedEngine::new("en").with_page(
            1,
            vec![
                ScriptedEngine::raw("Name: Jane Doe", 0.9),
                ScriptedEngine::raw("smudge", 0.05),
            ],
        );
        if let Some(gate) = gate {
            engine = engine.gated(gate);
        }
        harness_with_engine(engine).await
    }

    /// Like [`harness`], but with `engine` pre-warmed for `en`.
    async fn harness_with_engine(engine: ScriptedEngine) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path().join("uploads")).unwrap();
        let factory = Arc::new(CountingFactory::default());
        let pool = EnginePool::prewarm(
            &PrebuiltFactory(Arc::new(engine)),
            &LanguageSet::default(),
            false,
        )
        .await;
        let pipeline = DocumentPipeline::new(Arc::new(FakeRasterizer::new(3)), factory.clone());
        let runner = JobRunner::new(pipeline, pool);
        let (orchestrator, worker) = JobOrchestrator::start(store, runner, 2, 4);
        Harness {
            orchestrator: Arc::new(orchestrator),
            worker,
            factory,
            _dir: dir,
        }
    }

    /// Hands out the same engine every time.
    struct PrebuiltFactory(Arc<dyn OcrEngine>);

    #[async_trait]
    impl crate::ocr::engines::EngineFactory for PrebuiltFactory {
        async fn build(&self, _: &LanguageSet, _: bool) -> Result<Arc<dyn OcrEngine>> {
            Ok(self.0.clone())
        }
    }

    /// Poll until the job leaves `Processing`.
    pub(crate) async fn wait_for_terminal(orchestrator: &JobOrchestrator, id: &JobId) -> JobStatus {
        for _ in 0..500 {
            let status = orchestrator.status(id.as_str()).unwrap();
            if status != JobStatus::Processing {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never finished");
    }

    #[tokio::test]
    async fn job_is_processing_then_done() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(Some(gate.clone())).await;
        let id = h
            .orchestrator
            .submit(Some(FAKE_PDF), Some("scan.pdf"), OcrOptions::default())
            .unwrap();
        assert_eq!(h.orchestrator.status(id.as_str()).unwrap(), JobStatus::Processing);

        gate.add_permits(3);
        match wait_for_terminal(&h.orchestrator, &id).await {
            JobStatus::Done(pages) => {
                assert_eq!(pages.len(), 3);
                assert_eq!(pages[0].items.len(), 1);
                assert_eq!(pages[0].items[0].text, "Name: Jane Doe");
            }
            other => panic!("unexpected status {other:?}"),
        }
        let ws = h.orchestrator.store().open(&id);
        assert!(!ws.error_path().exists());
        assert_eq!(ws.read_manifest().unwrap().original_filename, "scan.pdf");
        // The pre-warmed engine was reused.
        assert_eq!(h.factory.builds(), 0);
    }

    #[tokio::test]
    async fn other_languages_get_their_own_engine() {
        let h = harness(None).await;
        let options = OcrOptions {
            languages: LanguageSet::from_str("en,fr").unwrap(),
            ..OcrOptions::default()
        };
        let id = h.orchestrator.submit(Some(FAKE_PDF), None, options).unwrap();
        assert!(matches!(
            wait_for_terminal(&h.orchestrator, &id).await,
            JobStatus::Done(_)
        ));
        assert_eq!(h.factory.builds(), 1);
    }

    #[tokio::test]
    async fn jobs_for_the_prewarmed_languages_share_its_engine() {
        let h = harness(None).await;
        let first = h
            .orchestrator
            .submit(Some(FAKE_PDF), None, OcrOptions::default())
            .unwrap();
        let options = OcrOptions {
            languages: LanguageSet::from_str("en").unwrap(),
            ..OcrOptions::default()
        };
        let second = h.orchestrator.submit(Some(FAKE_PDF), None, options).unwrap();
        for id in [&first, &second] {
            assert!(matches!(
                wait_for_terminal(&h.orchestrator, id).await,
                JobStatus::Done(_)
            ));
        }
        assert_eq!(h.factory.builds(), 0);
    }

    #[tokio::test]
    async fn non_finite_coordinates_still_give_a_readable_result() {
        let engine = ScriptedEngine::new("en").with_page(
            1,
            vec![RawDetection {
                quad: serde_json::json!([["NaN", 0], [10, "inf"], [10, 5], [0, 5]]),
                text: Value::String("Total".to_owned()),
                confidence: serde_json::json!(0.9),
            }],
        );
        let h = harness_with_engine(engine).await;
        let id = h
            .orchestrator
            .submit(Some(FAKE_PDF), None, OcrOptions::default())
            .unwrap();
        match wait_for_terminal(&h.orchestrator, &id).await {
            JobStatus::Done(pages) => {
                assert_eq!(
                    pages[0].items[0].bbox,
                    vec![vec![0.0, 0.0], vec![10.0, 0.0], vec![10.0, 5.0], vec![0.0, 5.0]]
                );
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_result_write_leaves_error_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        let manifest = JobManifest {
            original_filename: "scan.pdf".to_owned(),
            options: OcrOptions::default(),
        };
        let ws = store.create(FAKE_PDF, &manifest).unwrap();
        record_result(&ws, |_| Err(anyhow!("disk full")))
            .await
            .unwrap();
        match store.status(ws.id().as_str()).unwrap() {
            JobStatus::Failed(message) => {
                assert!(message.contains("could not save OCR result"), "{message}");
                assert!(message.contains("disk full"), "{message}");
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert!(!ws.result_path().exists());
    }

    #[tokio::test]
    async fn corrupt_document_fails_without_result() {
        let h = harness(None).await;
        let id = h
            .orchestrator
            .submit(Some(b"GIF89a not a pdf"), Some("scan.pdf"), OcrOptions::default())
            .unwrap();
        match wait_for_terminal(&h.orchestrator, &id).await {
            JobStatus::Failed(message) => assert!(message.contains("not a PDF"), "{message}"),
            other => panic!("unexpected status {other:?}"),
        }
        assert!(!h.orchestrator.store().open(&id).result_path().exists());
        assert!(h.orchestrator.result_path(id.as_str()).is_none());
        assert!(h.orchestrator.document_path(id.as_str()).is_some());
    }

    #[tokio::test]
    async fn missing_or_empty_uploads_are_rejected() {
        let h = harness(None).await;
        for document in [None, Some(&b""[..])] {
            let err = h
                .orchestrator
                .submit(document, Some("x.pdf"), OcrOptions::default())
                .unwrap_err();
            assert!(matches!(err, JobError::Validation(ref msg) if msg == "missing file"));
        }
        // Nothing was created.
        let root = h.orchestrator.store().root();
        assert_eq!(std::fs::read_dir(root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unknown_jobs_are_not_found() {
        let h = harness(None).await;
        assert_eq!(h.orchestrator.status("0123456789ab").unwrap(), JobStatus::NotFound);
        assert_eq!(h.orchestrator.status("nope").unwrap(), JobStatus::NotFound);
        assert!(h.orchestrator.document_path("0123456789ab").is_none());
    }

    #[tokio::test]
    async fn full_queue_rejects_and_cleans_up() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(Some(gate.clone())).await;
        // 2 workers plus 4 queue slots.
        let mut accepted = vec![];
        let mut rejected = 0;
        for _ in 0..10 {
            match h.orchestrator.submit(Some(FAKE_PDF), None, OcrOptions::default()) {
                Ok(id) => accepted.push(id),
                Err(JobError::QueueFull) => rejected += 1,
                Err(err) => panic!("unexpected error {err}"),
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(rejected > 0);
        let root = h.orchestrator.store().root();
        assert_eq!(std::fs::read_dir(root).unwrap().count(), accepted.len());

        gate.add_permits(1000);
        for id in &accepted {
            assert!(matches!(
                wait_for_terminal(&h.orchestrator, id).await,
                JobStatus::Done(_)
            ));
        }
    }

    #[tokio::test]
    async fn shutdown_drains_queued_jobs() {
        let h = harness(None).await;
        let ids = (0..3)
            .map(|_| {
                h.orchestrator
                    .submit(Some(FAKE_PDF), None, OcrOptions::default())
                    .unwrap()
            })
            .collect::<Vec<_>>();
        let Harness {
            orchestrator,
            worker,
            _dir,
            ..
        } = h;
        let store = orchestrator.store().clone();
        drop(orchestrator);
        worker.join().await.unwrap();
        for id in ids {
            assert!(matches!(store.status(id.as_str()).unwrap(), JobStatus::Done(_)));
        }
    }

    #[test]
    fn form_fields_become_options() {
        let fields = HashMap::from([("dpi".to_owned(), "72".to_owned())]);
        assert_eq!(form::options_from_form(&fields).dpi, 72);
    }
}
