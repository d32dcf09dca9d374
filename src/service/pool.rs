use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc::{self, Receiver, SyncSender, TrySendError},
    Arc, Mutex,
};
use std::thread;

use burn::tensor::backend::Backend;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::{
    error::{InferenceError, ServiceError},
    inference::{Prediction, Predictor},
};

struct Job {
    image: Vec<u8>,
    reply: oneshot::Sender<Result<Prediction, InferenceError>>,
}

type Response = oneshot::Receiver<Result<Prediction, InferenceError>>;

/// Fixed set of inference threads fed by a bounded queue.
///
/// Every worker owns a clone of the predictor. Clones share the same weight tensors, which
/// are never mutated after loading, so workers run without any locking around the model.
pub struct InferencePool {
    sender: Option<SyncSender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    abandoned: Arc<AtomicUsize>,
}

impl InferencePool {
    /// Spawn `workers` threads (at least one) sharing a queue of `queue_capacity` pending
    /// images (at least one).
    pub fn start<B: Backend>(
        predictor: Predictor<B>,
        workers: usize,
        queue_capacity: usize,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Job>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let abandoned = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers.max(1));
        for id in 0..workers.max(1) {
            let predictor = predictor.clone();
            let receiver = Arc::clone(&receiver);
            let abandoned = Arc::clone(&abandoned);
            let handle = thread::Builder::new()
                .name(format!("inference-{id}"))
                .spawn(move || work(id, predictor, receiver, abandoned))?;
            handles.push(handle);
        }

        debug!("Started {} inference workers", handles.len());
        Ok(Self {
            sender: Some(sender),
            handles,
            abandoned,
        })
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Queued images whose caller was gone before a worker reached them.
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Queue one encoded image, failing fast when the queue is full.
    fn submit(&self, image: Vec<u8>) -> Result<Response, ServiceError> {
        let (reply, response) = oneshot::channel();
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| ServiceError::Internal("inference pool is shut down".to_string()))?;

        match sender.try_send(Job { image, reply }) {
            Ok(()) => Ok(response),
            Err(TrySendError::Full(_)) => {
                warn!("Inference queue is full, rejecting request");
                Err(ServiceError::ServiceUnavailable)
            }
            Err(TrySendError::Disconnected(_)) => Err(ServiceError::Internal(
                "inference workers stopped".to_string(),
            )),
        }
    }

    /// Queue one encoded image and wait for its prediction.
    ///
    /// Dropping the returned future abandons the request. A worker that has not started on it
    /// yet skips it; one already running the forward pass discards the result.
    pub async fn predict(&self, image: Vec<u8>) -> Result<Prediction, ServiceError> {
        self.submit(image)?
            .await
            .map_err(|_| ServiceError::Internal("inference worker dropped the request".to_string()))?
            .map_err(ServiceError::from)
    }
}

fn work<B: Backend>(
    id: usize,
    predictor: Predictor<B>,
    receiver: Arc<Mutex<Receiver<Job>>>,
    abandoned: Arc<AtomicUsize>,
) {
    loop {
        // The lock is released before the job runs
        let job = match receiver.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => break,
        };
        let Ok(job) = job else {
            break;
        };

        if job.reply.is_closed() {
            abandoned.fetch_add(1, Ordering::Relaxed);
            debug!("Inference worker {} skipped an abandoned request", id);
            continue;
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| predictor.predict_bytes(&job.image)))
            .unwrap_or_else(|_| {
                error!("Inference worker {} panicked during a prediction", id);
                Err(InferenceError::InvalidOutput("prediction panicked".to_string()))
            });

        // The client may have gone away
        let _ = job.reply.send(result);
    }
    debug!("Inference worker {} stopped", id);
}

impl Drop for InferencePool {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop
        drop(self.sender.take());
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{preprocess::tests::encode_png, ClassMapping};
    use crate::model::MobileNetV2Config;
    use burn::backend::NdArray;
    use image::{DynamicImage, Rgb, RgbImage};

    type B = NdArray<f32>;

    fn predictor() -> Predictor<B> {
        let device = Default::default();
        let model = MobileNetV2Config::new(2)
            .with_width_mult(0.25)
            .init::<B>(&device);
        let classes = ClassMapping::new(vec!["blighted".into(), "healthy".into()]);
        Predictor::new(model, classes, &device).unwrap()
    }

    #[tokio::test]
    async fn workers_answer_like_the_predictor() {
        let predictor = predictor();
        let image = encode_png(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            40,
            30,
            Rgb([30, 160, 40]),
        )));
        let expected = predictor.predict_bytes(&image).unwrap();

        let pool = InferencePool::start(predictor, 3, 8).unwrap();
        assert_eq!(pool.workers(), 3);

        let (a, b) = tokio::join!(pool.predict(image.clone()), pool.predict(image));
        assert_eq!(a.unwrap(), expected);
        assert_eq!(b.unwrap(), expected);
    }

    #[tokio::test]
    async fn bad_uploads_are_client_errors() {
        let pool = InferencePool::start(predictor(), 1, 8).unwrap();
        let err = pool.predict(b"GIF89a garbage".to_vec()).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
    }

    #[test]
    fn zero_workers_still_starts_one() {
        let pool = InferencePool::start(predictor(), 0, 0).unwrap();
        assert_eq!(pool.workers(), 1);
        drop(pool);
    }

    fn leaf_png() -> Vec<u8> {
        encode_png(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            24,
            24,
            Rgb([30, 160, 40]),
        )))
    }

    #[test]
    fn abandoned_requests_are_skipped() {
        let (sender, receiver) = mpsc::sync_channel(16);
        let mut live = None;
        for i in 0..6 {
            let (reply, response) = oneshot::channel();
            sender.send(Job { image: leaf_png(), reply }).unwrap();
            // Only the last caller is still waiting
            if i == 5 {
                live = Some(response);
            }
        }
        drop(sender);

        let abandoned = Arc::new(AtomicUsize::new(0));
        work(0, predictor(), Arc::new(Mutex::new(receiver)), Arc::clone(&abandoned));

        assert_eq!(abandoned.load(Ordering::Relaxed), 5);
        let prediction = live.unwrap().try_recv().unwrap().unwrap();
        assert!((0.0..=100.0).contains(&prediction.confidence));
    }

    #[tokio::test]
    async fn a_full_queue_rejects_new_requests() {
        let pool = InferencePool::start(predictor(), 1, 1).unwrap();

        // One image in the worker and one queued at most, the rest is turned away
        let image = leaf_png();
        let submitted = (0..8)
            .map(|_| pool.submit(image.clone()))
            .collect::<Vec<_>>();
        let rejected = submitted
            .iter()
            .filter(|result| matches!(result, Err(ServiceError::ServiceUnavailable)))
            .count();
        assert!(rejected >= 6, "{rejected} of 8 rejected");

        for response in submitted.into_iter().flatten() {
            assert!(response.await.unwrap().is_ok());
        }
    }
}
