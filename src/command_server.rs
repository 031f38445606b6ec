/// Command server - small HTTP/1.1 JSON surface over a TCP socket.
///
/// One thread per connection, one request per connection. Every response
/// carries permissive CORS headers so the dashboard can call it from a
/// browser.

use crate::arm::{ArmPosition, ArmStateMachine, CommandOptions, CommandResult};
use crate::axis::{AxisId, Positions};
use crate::error::MotionError;
use crate::position_store::NamedPosition;
use crate::profile::ProfileKind;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MAX_BODY: usize = 64 * 1024;
const MAX_LINE: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Option<Value>,
}

impl Response {
    fn json(status: u16, body: Value) -> Self {
        Self { status, body: Some(body) }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, json!({ "success": false, "error": message.into() }))
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

#[derive(Debug, Deserialize)]
struct SetStateBody {
    state: String,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Deserialize)]
struct SavePositionBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AxisEnabledBody {
    axis: String,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct MoveBody {
    a: i32,
    b: i32,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    wait: bool,
    profile: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JogBody {
    axis: String,
    direction: i32,
}

fn parse_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> std::result::Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| Response::error(400, format!("Invalid JSON body: {}", e)))
}

fn parse_profile(name: &str) -> Option<ProfileKind> {
    match name.to_ascii_lowercase().as_str() {
        "home" | "toward_home" => Some(ProfileKind::TowardHome),
        "dip" | "toward_dip" => Some(ProfileKind::TowardDip),
        "close" | "toward_close" => Some(ProfileKind::TowardClose),
        "jog" => Some(ProfileKind::Jog),
        _ => None,
    }
}

fn parse_jog_axes(axis: &str) -> Option<Vec<AxisId>> {
    if axis.eq_ignore_ascii_case("both") {
        return Some(AxisId::ALL.to_vec());
    }
    axis.parse::<AxisId>().ok().map(|a| vec![a])
}

/// Busy is a normal outcome, bad input is the client's fault, the rest is
/// ours.
fn motion_error(e: MotionError) -> Response {
    match e {
        MotionError::RejectedBusy => {
            Response::json(200, json!({ "success": false, "error": e.to_string(), "movement_duration": 0.0 }))
        }
        MotionError::InvalidTarget(_) | MotionError::InvalidProfile(_) => Response::error(400, e.to_string()),
        MotionError::HardwareFault(_) | MotionError::PersistenceFault(_) => Response::error(500, e.to_string()),
    }
}

fn command_response(result: CommandResult) -> Response {
    match serde_json::to_value(&result) {
        Ok(body) => Response::json(200, body),
        Err(e) => Response::error(500, e.to_string()),
    }
}

pub struct CommandServer {
    arm: Arc<ArmStateMachine>,
}

impl CommandServer {
    pub fn new(arm: Arc<ArmStateMachine>) -> Self {
        Self { arm }
    }

    /// Dispatch one request. Pure with respect to the transport so it can be
    /// tested without sockets.
    pub fn route(&self, method: &str, path: &str, body: &[u8]) -> Response {
        let path = path.split('?').next().unwrap_or(path);
        if method == "OPTIONS" {
            return Response { status: 200, body: None };
        }

        let result = match (method, path) {
            ("GET", "/health") => Ok(Response::json(200, json!({
                "status": "ok",
                "pi": "bubblebot",
                "fan_running": self.arm.fan().is_running(),
            }))),
            ("GET", "/positions") | ("GET", "/status") => Ok(self.positions()),
            ("POST", "/set_state") => self.set_state(body),
            ("POST", "/update_config") => self.update_config(body),
            ("GET", "/config") => Ok(Response::json(200, json!({ "success": true, "config": self.arm.runtime() }))),
            ("POST", "/save_position") => self.save_position(body),
            ("POST", "/reset_home") => Ok(match self.arm.reset_to_home() {
                Ok(result) => command_response(result),
                Err(e) => motion_error(e),
            }),
            ("POST", "/axis_enabled") => self.axis_enabled(body),
            ("POST", "/move") => self.raw_move(body),
            ("POST", "/jog") => self.jog(body),
            ("POST", "/jog_stop") => Ok(match self.arm.stop_jog() {
                Ok(result) => command_response(result),
                Err(e) => motion_error(e),
            }),
            (_, "/health" | "/positions" | "/status" | "/set_state" | "/update_config" | "/config"
                | "/save_position" | "/reset_home" | "/axis_enabled" | "/move" | "/jog" | "/jog_stop") => {
                Err(Response::error(405, format!("{} not allowed on {}", method, path)))
            }
            _ => Err(Response::error(404, "Not found")),
        };
        result.unwrap_or_else(|response| response)
    }

    fn positions(&self) -> Response {
        let mut response = command_response(self.arm.status());
        if let Some(Value::Object(map)) = response.body.as_mut() {
            map.insert("saved".to_string(), json!(self.arm.snapshot()));
            map.insert("moving".to_string(), json!(self.arm.scheduler().is_busy()));
        }
        response
    }

    fn set_state(&self, body: &[u8]) -> std::result::Result<Response, Response> {
        let req: SetStateBody = parse_body(body)?;
        let command: ArmPosition = req
            .state
            .parse()
            .map_err(|_| Response::json(400, json!({ "error": "Invalid state" })))?;
        let options = CommandOptions { force: req.force, wait: req.wait };
        let mut response = match self.arm.handle(command, options) {
            Ok(result) => command_response(result),
            Err(e) => motion_error(e),
        };
        if let Some(Value::Object(map)) = response.body.as_mut() {
            map.insert("state".to_string(), json!(command));
        }
        Ok(response)
    }

    fn update_config(&self, body: &[u8]) -> std::result::Result<Response, Response> {
        let update: Value = parse_body(body)?;
        match self.arm.update_settings(&update) {
            Ok((config, ignored)) => Ok(Response::json(200, json!({
                "success": true,
                "config": config,
                "ignored": ignored,
            }))),
            Err(e) => Err(Response::error(400, format!("{:#}", e))),
        }
    }

    fn save_position(&self, body: &[u8]) -> std::result::Result<Response, Response> {
        let req: SavePositionBody = parse_body(body)?;
        let name: NamedPosition = req.name.parse().map_err(|e: String| Response::error(400, e))?;
        match self.arm.save_current_as(name) {
            Ok(saved) => Ok(Response::json(200, json!({
                "success": true,
                "saved": saved,
                "positions": self.arm.positions(),
            }))),
            Err(e) => Ok(motion_error(e)),
        }
    }

    fn axis_enabled(&self, body: &[u8]) -> std::result::Result<Response, Response> {
        let req: AxisEnabledBody = parse_body(body)?;
        let axis: AxisId = req.axis.parse().map_err(|e: String| Response::error(400, e))?;
        Ok(command_response(self.arm.set_axis_enabled(axis, req.enabled)))
    }

    fn raw_move(&self, body: &[u8]) -> std::result::Result<Response, Response> {
        let req: MoveBody = parse_body(body)?;
        let kind = match req.profile.as_deref() {
            None => ProfileKind::TowardDip,
            Some(name) => parse_profile(name)
                .ok_or_else(|| Response::error(400, format!("unknown profile '{}'", name)))?,
        };
        let options = CommandOptions { force: req.force, wait: req.wait };
        Ok(match self.arm.submit_move(Positions::new(req.a, req.b), kind, options) {
            Ok(result) => command_response(result),
            Err(e) => motion_error(e),
        })
    }

    fn jog(&self, body: &[u8]) -> std::result::Result<Response, Response> {
        let req: JogBody = parse_body(body)?;
        let axes = parse_jog_axes(&req.axis)
            .ok_or_else(|| Response::error(400, format!("unknown axis '{}'", req.axis)))?;
        let forward = match req.direction {
            1 => true,
            -1 => false,
            other => return Err(Response::error(400, format!("direction must be 1 or -1, got {}", other))),
        };
        Ok(match self.arm.jog(axes, forward) {
            Ok(result) => command_response(result),
            Err(e) => motion_error(e),
        })
    }

    /// Accept connections until `running` is cleared.
    pub fn serve(self: Arc<Self>, listener: TcpListener, running: Arc<AtomicBool>) -> Result<()> {
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        log::info!(target: "command_server", "Listening on http://{}", addr);

        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    let spawned = thread::Builder::new()
                        .name("bubblebot-http".to_string())
                        .spawn(move || {
                            if let Err(e) = server.handle_connection(stream, peer) {
                                log::warn!(target: "command_server", "Request from {} failed: {:#}", peer, e);
                            }
                        });
                    if let Err(e) = spawned {
                        log::error!(target: "command_server", "Could not spawn connection thread: {}", e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    log::warn!(target: "command_server", "Accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        log::info!(target: "command_server", "Command server stopped");
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        let response = match read_request(&mut reader) {
            Ok(request) => {
                log::debug!(target: "command_server", "{} {} from {}", request.method, request.path, peer);
                self.route(&request.method, &request.path, &request.body)
            }
            Err(e) => {
                log::warn!(target: "command_server", "Bad request from {}: {:#}", peer, e);
                Response::error(400, e.to_string())
            }
        };
        write_response(&mut writer, &response)
    }
}

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

/// Read one CRLF-terminated line of at most MAX_LINE bytes.
fn read_line_capped<R: BufRead>(reader: &mut R, line: &mut String) -> Result<usize> {
    let n = reader.by_ref().take(MAX_LINE as u64).read_line(line)?;
    if n == MAX_LINE && !line.ends_with('\n') {
        return Err(anyhow!("line longer than {} bytes", MAX_LINE));
    }
    Ok(n)
}

pub fn read_request<R: BufRead>(reader: &mut R) -> Result<Request> {
    let mut line = String::new();
    read_line_capped(reader, &mut line).context("reading request line")?;
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("empty request"))?.to_string();
    let path = parts.next().ok_or_else(|| anyhow!("request line without path"))?.to_string();

    let mut content_length = 0usize;
    let mut headers = 0;
    loop {
        let mut header = String::new();
        if read_line_capped(reader, &mut header)? == 0 {
            break;
        }
        headers += 1;
        if headers > MAX_HEADERS {
            return Err(anyhow!("more than {} header lines", MAX_HEADERS));
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().context("bad Content-Length")?;
            }
        }
    }
    if content_length > MAX_BODY {
        return Err(anyhow!("body of {} bytes exceeds {} byte limit", content_length, MAX_BODY));
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).context("reading body")?;
    Ok(Request { method, path, body })
}

pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    let body = match &response.body {
        Some(value) => serde_json::to_vec(value)?,
        None => Vec::new(),
    };
    write!(
        writer,
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Connection: close\r\n\r\n",
        response.status,
        reason(response.status),
        body.len()
    )?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}
