use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::PipelineError;
use crate::types::MessageProperties;

/// Downstream processing of one dequeued message
///
/// Failures are reported back to the consumer, which logs them. By the
/// time the pipeline runs, a client-acknowledged message is already stored
/// and acknowledged, so a failure here never causes broker redelivery.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn process(
        &self,
        ctx: &RequestContext,
        header: &MessageProperties,
        body: &str,
    ) -> Result<(), PipelineError>;
}

type PipelineFuture = Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send>>;

type PipelineFnBox =
    Box<dyn Fn(RequestContext, MessageProperties, String) -> PipelineFuture + Send + Sync>;

/// Pipeline backed by a closure
pub struct FnPipeline {
    f: PipelineFnBox,
}

/// Adapt a closure into a [`Pipeline`]
///
/// The closure receives owned copies of the context, header and body.
///
/// # Example
///
/// ```
/// use provbus::pipeline::pipeline_fn;
///
/// let pipeline = pipeline_fn(|ctx, _header, body| async move {
///     println!("{} on {:?}: {}", ctx.message_id, ctx.queue_name, body);
///     Ok(())
/// });
/// ```
pub fn pipeline_fn<F, Fut>(f: F) -> Arc<FnPipeline>
where
    F: Fn(RequestContext, MessageProperties, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
{
    Arc::new(FnPipeline {
        f: Box::new(
            move |ctx: RequestContext, header: MessageProperties, body: String| -> PipelineFuture {
                Box::pin(f(ctx, header, body))
            },
        ),
    })
}

#[async_trait]
impl Pipeline for FnPipeline {
    async fn process(
        &self,
        ctx: &RequestContext,
        header: &MessageProperties,
        body: &str,
    ) -> Result<(), PipelineError> {
        (self.f)(ctx.clone(), header.clone(), body.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_pipeline_fn_receives_inputs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let pipeline = pipeline_fn(move |ctx, header, body| {
            let seen = Arc::clone(&seen);
            async move {
                assert_eq!(ctx.message_id, "ID:1");
                assert_eq!(header.get("k"), Some("v"));
                assert_eq!(body, "payload");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let ctx = RequestContext::for_message("ID:1", "Q1");
        let header = MessageProperties::new().with("k", "v");
        pipeline.process(&ctx, &header, "payload").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pipeline_fn_propagates_errors() {
        let pipeline = pipeline_fn(|_, _, _| async { Err("boom".into()) });
        let result = pipeline
            .process(&RequestContext::default(), &MessageProperties::new(), "")
            .await;
        assert_eq!(result.unwrap_err().to_string(), "boom");
    }
}
