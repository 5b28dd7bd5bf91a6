//! Minimal JSON status surface over the durable queue.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use optq_runner::CaseApi;
use serde_json::{json, Value};
use tiny_http::{Header, Method, Response, Server};
use tracing::{info, warn};

use crate::{error_code, json_error};

pub fn serve(bind: &str, api: CaseApi) -> Result<()> {
    let server = Server::http(bind).map_err(|e| anyhow!("failed to bind {}: {}", bind, e))?;
    info!(bind, "http surface listening");
    for request in server.incoming_requests() {
        let (status, body) = route(&api, request.method(), request.url());
        let mut response = Response::from_string(body.to_string()).with_status_code(status);
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
            response = response.with_header(header);
        }
        if let Err(err) = request.respond(response) {
            warn!(error = %err, "failed to write http response");
        }
    }
    Ok(())
}

fn route(api: &CaseApi, method: &Method, url: &str) -> (u16, Value) {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    let case = params.get("case").map(String::as_str);

    let outcome = match (method, path) {
        (Method::Post, "/submit") => with_case(case, |id| {
            let reply = api.submit_case(id)?;
            Ok(json!({ "ok": true, "case_id": id, "added": reply.added, "message": reply.message }))
        }),
        (Method::Post, "/withdraw") => with_case(case, |id| {
            Ok(json!({ "ok": true, "case_id": id, "withdrawn": api.withdraw_case(id)? }))
        }),
        (Method::Get, "/status") => with_case(case, |id| {
            Ok(json!({ "ok": true, "case_id": id, "status": api.get_status(id)? }))
        }),
        (Method::Get, "/progress") => with_case(case, |id| {
            Ok(json!({ "ok": true, "progress": api.get_progress(id)? }))
        }),
        (Method::Get, "/log") => {
            let max_chars = match params.get("max_chars").map(|v| v.parse::<usize>()) {
                Some(Ok(n)) => Some(n),
                Some(Err(_)) => {
                    return (
                        400,
                        json_error("bad_parameter", "max_chars must be a number".to_string(), json!({})),
                    )
                }
                None => None,
            };
            with_case(case, |id| {
                Ok(json!({ "ok": true, "case_id": id, "log": api.get_log_tail(id, max_chars)? }))
            })
        }
        (Method::Get, "/cases") => list_cases(api).map(Some),
        _ => {
            return (
                404,
                json_error("not_found", format!("no route for {} {}", method, path), json!({})),
            )
        }
    };

    match outcome {
        Ok(Some(body)) => (200, body),
        Ok(None) => (
            400,
            json_error("missing_parameter", "query parameter 'case' is required".to_string(), json!({})),
        ),
        Err(err) => (500, json_error(error_code(&err), err.to_string(), json!({}))),
    }
}

fn list_cases(api: &CaseApi) -> Result<Value> {
    Ok(json!({ "ok": true, "cases": api.list_cases()?, "counts": api.counts()? }))
}

/// `Ok(None)` when the request has no `case` parameter.
fn with_case(case: Option<&str>, f: impl FnOnce(&str) -> Result<Value>) -> Result<Option<Value>> {
    match case.filter(|c| !c.is_empty()) {
        Some(id) => f(id).map(Some),
        None => Ok(None),
    }
}
