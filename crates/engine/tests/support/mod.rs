//! Shared wiring for stage-graph integration tests: an in-memory completer
//! whose dispatch callbacks are routed straight back into a
//! [`ContinuationInvoker`], the way a real container would be re-entered.

use std::sync::Arc;

use async_trait::async_trait;

use rill_client::{
    blobs::BlobStoreClient,
    completer::CompleterClient,
    protocol::{InvokeStageRequest, InvokeStageResponse},
};
use rill_engine::{ContinuationInvoker, Flow, HandlerRegistry};
use rill_testkit::{ContinuationDispatcher, InMemBlobStore, InMemCompleter, StubFunctionBackend};

pub struct Harness {
    pub completer: Arc<InMemCompleter>,
    pub blobs: Arc<InMemBlobStore>,
    pub functions: Arc<StubFunctionBackend>,
}

struct InvokerDispatcher {
    invoker: ContinuationInvoker,
    completer: Arc<InMemCompleter>,
    blobs: Arc<dyn BlobStoreClient>,
}

#[async_trait]
impl ContinuationDispatcher for InvokerDispatcher {
    async fn dispatch(&self, request: InvokeStageRequest) -> InvokeStageResponse {
        let completer: Arc<dyn CompleterClient> = self.completer.clone();
        let flow = Flow::attach(request.flow_id.clone(), completer, self.blobs.clone());
        self.invoker.invoke_stage(&flow, request).await
    }
}

pub fn harness(registry: HandlerRegistry) -> Harness {
    let blobs = Arc::new(InMemBlobStore::new());
    let blob_client: Arc<dyn BlobStoreClient> = blobs.clone();
    let completer = Arc::new(InMemCompleter::new(blob_client.clone()));
    let functions = Arc::new(StubFunctionBackend::new());
    completer.set_function_backend(functions.clone());
    completer.set_dispatcher(Arc::new(InvokerDispatcher {
        invoker: ContinuationInvoker::new(Arc::new(registry)),
        completer: completer.clone(),
        blobs: blob_client,
    }));
    Harness {
        completer,
        blobs,
        functions,
    }
}

impl Harness {
    pub async fn flow(&self) -> Flow {
        let completer: Arc<dyn CompleterClient> = self.completer.clone();
        Flow::create(completer, self.blobs.clone(), "test-fn")
            .await
            .expect("create flow")
    }
}
