//! Production transport: a hyper-util client that reports its traffic

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::HeaderMap;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::client::legacy::{Client, Error as ClientError};
use hyper_util::rt::TokioExecutor;
use tracing::trace;

use super::{ObserverSlot, TrafficObserver, TransportHook};
use crate::exchange::{ExchangeId, InterceptedRequest};

/// HTTP client whose requests are visible to an installed observer
///
/// Requests are forwarded unchanged. While no observer is installed the
/// transport adds nothing but an atomic load per request.
pub struct HyperTransport<C = HttpConnector> {
    client: Client<C, Full<Bytes>>,
    slot: Arc<ObserverSlot>,
}

impl HyperTransport<HttpConnector> {
    /// Plain-HTTP transport on the Tokio runtime
    #[must_use]
    pub fn http() -> Self {
        Self::new(Client::builder(TokioExecutor::new()).build_http())
    }
}

impl<C> HyperTransport<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    /// Wrap an existing client (e.g. one with a TLS connector)
    #[must_use]
    pub fn new(client: Client<C, Full<Bytes>>) -> Self {
        Self {
            client,
            slot: Arc::new(ObserverSlot::default()),
        }
    }

    /// Send a request, reporting it to the installed observer
    ///
    /// # Errors
    ///
    /// Returns the client's error unchanged if the request fails
    pub async fn request(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<RecordingBody<Incoming>>, ClientError> {
        let mut pending = PendingTap(self.slot.current().map(|observer| {
            let id = self.slot.next_id();
            observer.on_request_start(id, snapshot(&request));
            Tap { observer, id }
        }));

        match self.client.request(request.map(Full::new)).await {
            Ok(response) => {
                let tap = pending.0.take();
                if let Some(tap) = &tap {
                    tap.observer.on_response_headers(
                        tap.id,
                        response.status().as_u16(),
                        header_pairs(response.headers()),
                    );
                }
                Ok(response.map(|body| RecordingBody::new(body, tap)))
            }
            Err(e) => {
                if let Some(tap) = pending.0.take() {
                    tap.observer.on_error(tap.id, &e.to_string());
                }
                Err(e)
            }
        }
    }
}

impl<C> TransportHook for HyperTransport<C>
where
    C: Send + Sync,
{
    fn install(&self, observer: Arc<dyn TrafficObserver>) {
        self.slot.install(observer);
    }

    fn uninstall(&self) {
        self.slot.uninstall();
    }

    fn is_installed(&self) -> bool {
        self.slot.current().is_some()
    }
}

struct Tap {
    observer: Arc<dyn TrafficObserver>,
    id: ExchangeId,
}

/// Reports a cancel if the request future is dropped before a response
struct PendingTap(Option<Tap>);

impl Drop for PendingTap {
    fn drop(&mut self) {
        if let Some(tap) = self.0.take() {
            tap.observer.on_cancel(tap.id);
        }
    }
}

/// Response body that reports every data frame to the observer
///
/// End of stream reports completion, a body error reports an error, and
/// dropping the body before its end reports a cancellation.
pub struct RecordingBody<B> {
    inner: B,
    tap: Option<Tap>,
}

impl<B: Body> RecordingBody<B> {
    fn new(inner: B, tap: Option<Tap>) -> Self {
        let mut body = Self { inner, tap };
        if body.inner.is_end_stream() {
            body.complete();
        }
        body
    }

    /// Wrap a body without reporting anything
    #[must_use]
    pub fn passthrough(inner: B) -> Self {
        Self { inner, tap: None }
    }

    fn complete(&mut self) {
        if let Some(tap) = self.tap.take() {
            trace!("Response body {} finished", tap.id);
            tap.observer.on_complete(tap.id);
        }
    }

    fn fail(&mut self, reason: &str) {
        if let Some(tap) = self.tap.take() {
            tap.observer.on_error(tap.id, reason);
        }
    }
}

impl<B> Body for RecordingBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(tap), Some(data)) = (&this.tap, frame.data_ref()) {
                    tap.observer.on_body_chunk(tap.id, data);
                }
                if this.inner.is_end_stream() {
                    this.complete();
                }
            }
            Poll::Ready(Some(Err(e))) => this.fail(&e.to_string()),
            Poll::Ready(None) => this.complete(),
            Poll::Pending => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for RecordingBody<B> {
    fn drop(&mut self) {
        if let Some(tap) = self.tap.take() {
            tap.observer.on_cancel(tap.id);
        }
    }
}

fn snapshot(request: &Request<Bytes>) -> InterceptedRequest {
    InterceptedRequest {
        method: request.method().as_str().to_string(),
        uri: request.uri().clone(),
        headers: header_pairs(request.headers()),
        body: request.body().clone(),
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}
