//! Request-log middleware, adapted near-verbatim from the teacher's
//! `webserver::middleware::tracing::Tracing` (`SPEC_FULL.md` §4 HTTPSurface
//! note). Warden has no end-user auth to enforce on its own surface, so the
//! teacher's `BearerAuthMiddleware` is not carried over — only this logger.

use std::time::Instant;

use poem::{Endpoint, IntoResponse, Middleware, Request, Response};
use tracing::{Instrument, Level};

#[derive(Default)]
pub struct RequestTracing;

impl<E: Endpoint> Middleware<E> for RequestTracing {
    type Output = RequestTracingEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        RequestTracingEndpoint { inner: ep }
    }
}

pub struct RequestTracingEndpoint<E> {
    inner: E,
}

impl<E: Endpoint> Endpoint for RequestTracingEndpoint<E> {
    type Output = Response;

    async fn call(&self, req: Request) -> poem::Result<Self::Output> {
        let endpoint = format!("{} {}", req.method(), req.original_uri());

        let span = tracing::span!(
            target: module_path!(),
            Level::DEBUG,
            "request",
            endpoint = %endpoint,
        );

        async move {
            let now = Instant::now();
            let res = self.inner.call(req).await;
            let duration = now.elapsed();

            match res {
                Ok(resp) => {
                    let resp = resp.into_response();
                    tracing::info!(status = %resp.status(), duration = ?duration, "response");
                    Ok(resp)
                }
                Err(err) => {
                    tracing::info!(status = %err.status(), error = %err, duration = ?duration, "error");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}
