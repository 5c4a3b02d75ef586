//! Built-in worker routes.
//!
//! The default harness serves a ping endpoint, an echo endpoint, and,
//! when the vault is part of the deployment, the session demo trio
//! (`/login`, `/me`, `/logout`) that exercises create/read/destroy against
//! the sidecar. Applications embedding `janus_rs` replace this module with
//! their own registrations.

use serde_json::json;

use janus_rs::runtime::session::SessionLayer;
use janus_rs::runtime::{handler_fn, App, HandlerError, Response};

pub fn register(app: &mut App, session: Option<SessionLayer>) {
    app.router.get(
        "/janus/ping",
        handler_fn(|_req| Box::pin(async move { Ok(Response::text(200, "pong")) })),
    );

    app.router.post(
        "/echo",
        handler_fn(|req| {
            let body = req.body.clone();
            let content_type = req
                .header("content-type")
                .unwrap_or("application/octet-stream")
                .to_string();
            Box::pin(async move {
                let mut resp = Response {
                    status: 200,
                    headers: vec![("content-type".to_string(), content_type)],
                    body,
                };
                resp.set_header("x-echo", "1");
                Ok(resp)
            })
        }),
    );

    app.router.get(
        "/echo/:word",
        handler_fn(|req| {
            let word = req.params.get("word").unwrap_or("").to_string();
            Box::pin(async move { Ok(Response::text(200, word)) })
        }),
    );

    let Some(session) = session else { return };

    let login_layer = session.clone();
    app.router.post(
        "/login",
        handler_fn(move |req| {
            let layer = login_layer.clone();
            let body = req.body.clone();
            Box::pin(async move {
                let user = serde_json::from_slice::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("user").and_then(|u| u.as_str()).map(str::to_string));
                let Some(user) = user else {
                    return Ok(Response::json(
                        400,
                        &json!({ "error": "bad-request", "message": "body must be {\"user\": ...}" }),
                    ));
                };

                let payload = json!({ "user": user }).to_string();
                let token = layer
                    .client()
                    .create(
                        &layer.settings().sandbox,
                        payload.as_bytes(),
                        Some(layer.settings().ttl),
                    )
                    .await
                    .map_err(|e| HandlerError::failed(format!("session create: {}", e)))?;

                let mut resp = Response::json(200, &json!({ "user": user }));
                layer.stamp(&mut resp, &token);
                Ok(resp)
            })
        }),
    );

    app.router.get(
        "/me",
        handler_fn(|req| {
            let session = req.session.clone();
            Box::pin(async move {
                match session {
                    Some(session) => {
                        let data = session.json().unwrap_or(json!(null));
                        Ok(Response::json(200, &json!({ "session": data })))
                    }
                    None => Ok(Response::json(
                        401,
                        &json!({ "error": "unauthorized", "message": "no valid session" }),
                    )),
                }
            })
        }),
    );

    let logout_layer = session;
    app.router.post(
        "/logout",
        handler_fn(move |req| {
            let layer = logout_layer.clone();
            let session = req.session.clone();
            Box::pin(async move {
                if let Some(session) = session {
                    layer
                        .client()
                        .destroy(&session.token)
                        .await
                        .map_err(|e| HandlerError::failed(format!("session destroy: {}", e)))?;
                }
                Ok(Response::json(200, &json!({ "loggedOut": true })))
            })
        }),
    );
}
