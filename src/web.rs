use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use colored::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::{Limits, RelayConfig};
use crate::error::RelayError;
use crate::hub::{self, Hub, HubHandle};

/// Largest request head accepted before answering 431.
const MAX_REQUEST_HEAD: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;
/// How long a client may take to send its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const PEEK_RETRY: Duration = Duration::from_millis(5);

/// Path of the WebSocket endpoint.
pub const WS_PATH: &str = "/ws";

/// Embedded single-page chat client, served at `/` when the static root has
/// no `index.html`. Renders only what the server sends back.
pub const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Chat Relay</title>
<style>
*{margin:0;padding:0;box-sizing:border-box}
body{background:#0d1117;color:#c9d1d9;font-family:system-ui,sans-serif;height:100vh;display:flex;flex-direction:column}
header{padding:12px 20px;border-bottom:1px solid #21262d;display:flex;justify-content:space-between;align-items:center}
header h1{font-size:1.1rem;color:#58a6ff}
#chat-messages{flex:1;overflow-y:auto;padding:16px 20px;display:flex;flex-direction:column;gap:8px}
.message{max-width:70%;padding:8px 12px;border-radius:8px;background:#161b22;align-self:flex-start;word-wrap:break-word}
.message.sent{background:#1f6feb;color:#fff;align-self:flex-end}
.message-info{font-size:.7rem;opacity:.7;margin-top:4px;display:flex;gap:8px}
.media-content img,.media-content video{max-width:100%;border-radius:6px;margin-top:4px}
#typing-indicator{padding:4px 20px;font-size:.8rem;color:#8b949e;min-height:1.4em}
#composer{display:flex;gap:8px;padding:12px 20px;border-top:1px solid #21262d}
#message-input{flex:1;background:#0d1117;border:1px solid #30363d;color:#c9d1d9;padding:8px 10px;border-radius:6px}
.btn{border:none;padding:8px 12px;border-radius:6px;cursor:pointer;color:#fff;background:#238636}
.btn.alt{background:#30363d}
#error-bar{display:none;padding:6px 20px;background:#3d1214;color:#f85149;font-size:.8rem}
#error-bar.show{display:block}
#login-modal{position:fixed;inset:0;background:rgba(0,0,0,.7);display:flex;align-items:center;justify-content:center}
#login-modal.hidden,.hidden{display:none}
.login-box{background:#161b22;padding:24px;border-radius:8px;display:flex;flex-direction:column;gap:12px;min-width:280px}
.login-box input{background:#0d1117;border:1px solid #30363d;color:#c9d1d9;padding:8px 10px;border-radius:6px}
</style>
</head>
<body>
<header><h1>Chat Relay</h1><div><span id="username-display"></span> <button id="logout-btn" class="btn alt">Leave</button></div></header>
<div id="error-bar"></div>
<div id="chat-messages"></div>
<div id="typing-indicator"></div>
<div id="composer">
<input id="message-input" type="text" placeholder="Type a message" autocomplete="off">
<button id="image-btn" class="btn alt" data-accept="image/*">Image</button>
<button id="video-btn" class="btn alt" data-accept="video/*">Video</button>
<button id="audio-btn" class="btn alt" data-accept="audio/*">Audio</button>
<input id="file-input" type="file" class="hidden">
<button id="send-btn" class="btn">Send</button>
</div>
<div id="login-modal"><div class="login-box"><b>Choose a name</b><input id="username-input" type="text" maxlength="64"><button id="login-btn" class="btn">Join</button></div></div>
<script>
(function(){
const $=id=>document.getElementById(id);
const list=$('chat-messages'),input=$('message-input'),typing=$('typing-indicator'),errBar=$('error-bar');
const TYPING_TIMEOUT=2000;
let ws=null,username='',typingTimer=null,selfTypingTimer=null;

function send(event,data){if(ws&&ws.readyState===1)ws.send(JSON.stringify({event:event,data:data||{}}));}

function render(m){
  const div=document.createElement('div');
  div.className='message'+(m.username===username?' sent':'');
  if(m.text){const t=document.createElement('div');t.textContent=m.text;div.appendChild(t);}
  if(m.media){
    const wrap=document.createElement('div');wrap.className='media-content';
    const kind=m.media.type.split('/')[0];
    const el=document.createElement(kind==='image'?'img':kind);
    if(kind!=='image')el.controls=true;
    el.src=m.media.url;wrap.appendChild(el);div.appendChild(wrap);
  }
  const info=document.createElement('div');info.className='message-info';
  const who=document.createElement('span');who.textContent=m.username;
  const when=document.createElement('span');when.textContent=new Date(m.timestamp).toLocaleTimeString();
  info.appendChild(who);info.appendChild(when);div.appendChild(info);
  list.appendChild(div);
}
function scrollDown(){list.scrollTop=list.scrollHeight;}

function connect(){
  ws=new WebSocket((location.protocol==='https:'?'wss://':'ws://')+location.host+'/ws');
  ws.onmessage=function(e){
    const f=JSON.parse(e.data);
    switch(f.event){
      case 'previousMessages':list.innerHTML='';f.data.forEach(render);scrollDown();break;
      case 'message':render(f.data);scrollDown();break;
      case 'typing':
        typing.textContent=f.data.username+' is typing...';
        clearTimeout(typingTimer);typingTimer=setTimeout(()=>{typing.textContent='';},TYPING_TIMEOUT);break;
      case 'stopTyping':typing.textContent='';break;
      case 'userLeft':typing.textContent=f.data.username+' left';break;
      case 'error':errBar.textContent=f.data.message;errBar.classList.add('show');setTimeout(()=>errBar.classList.remove('show'),4000);break;
    }
  };
  ws.onclose=function(){ws=null;};
}

function sendText(){
  const text=input.value.trim();
  if(!text)return;
  send('message',{username:username,text:text,timestamp:new Date().toISOString()});
  send('stopTyping');
  input.value='';
}
function sendMedia(file){
  if(!file)return;
  const reader=new FileReader();
  reader.onload=function(e){send('message',{username:username,text:'',media:{url:e.target.result,type:file.type},timestamp:new Date().toISOString()});};
  reader.readAsDataURL(file);
}

$('login-btn').onclick=function(){
  const name=$('username-input').value.trim();
  if(!name){alert('Please enter a name');return;}
  username=name;$('username-display').textContent=name;$('login-modal').classList.add('hidden');connect();input.focus();
};
$('logout-btn').onclick=function(){if(ws)ws.close();username='';list.innerHTML='';$('login-modal').classList.remove('hidden');};
$('send-btn').onclick=sendText;
input.addEventListener('keypress',e=>{if(e.key==='Enter')sendText();});
input.addEventListener('input',function(){
  if(input.value){send('typing',{username:username});clearTimeout(selfTypingTimer);selfTypingTimer=setTimeout(()=>send('stopTyping'),TYPING_TIMEOUT);}
  else send('stopTyping');
});
['image-btn','video-btn','audio-btn'].forEach(id=>{$(id).onclick=function(){const fi=$('file-input');fi.accept=this.dataset.accept;fi.click();};});
$('file-input').onchange=function(){sendMedia(this.files[0]);this.value='';};
})();
</script>
</body>
</html>"##;

/// Shared, read-only state for every accepted socket.
struct Context {
    hub: HubHandle,
    limits: Limits,
    static_dir: PathBuf,
}

/// A bound listener with its hub already running.
pub struct Server {
    listener: TcpListener,
    ctx: Arc<Context>,
}

impl Server {
    /// Bind the configured address and start the hub task.
    pub async fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let hub = hub::spawn(Hub::new(config.hub.clone()));
        Ok(Self {
            listener,
            ctx: Arc::new(Context {
                hub,
                limits: config.limits,
                static_dir: config.server.static_dir.clone(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> &HubHandle {
        &self.ctx.hub
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, ctx).await {
                    debug!(%addr, error = %e, "connection ended with error");
                }
            });
        }
    }
}

/// Bind, print the banner and serve until Ctrl-C.
pub async fn serve(config: RelayConfig) -> Result<(), RelayError> {
    let server = Server::bind(&config).await?;
    let addr = server.local_addr()?;

    eprintln!(
        "{}",
        format!("  Chat relay listening on http://{}", addr).bright_green()
    );
    eprintln!("{}", format!("  WebSocket endpoint: ws://{}{}", addr, WS_PATH).bright_cyan());
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    info!(
        %addr,
        max_history = config.hub.max_history,
        echo_to_sender = config.hub.echo_to_sender,
        static_dir = %config.server.static_dir.display(),
        "server started"
    );

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Request handling
// ---------------------------------------------------------------------------

/// The parts of a request head this server routes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Length of the head in bytes, including the final `\r\n\r\n`.
    pub len: usize,
    pub upgrade_websocket: bool,
    pub connection_upgrade: bool,
    pub websocket_key: Option<String>,
    pub websocket_version: Option<String>,
}

/// Why a WebSocket upgrade request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeRejection {
    /// Not an upgrade request at all, or missing `Connection: Upgrade` or a key.
    BadRequest,
    /// `Sec-WebSocket-Version` is not 13.
    UnsupportedVersion,
}

impl RequestHead {
    /// Check the RFC 6455 opening-handshake headers.
    pub fn check_upgrade(&self) -> Result<(), UpgradeRejection> {
        if !self.upgrade_websocket || !self.connection_upgrade || self.websocket_key.is_none() {
            return Err(UpgradeRejection::BadRequest);
        }
        if self.websocket_version.as_deref() != Some("13") {
            return Err(UpgradeRejection::UnsupportedVersion);
        }
        Ok(())
    }
}

/// Parse a request head. Returns `None` until the whole head (through
/// `\r\n\r\n`) is present in `buf`.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let httparse::Status::Complete(len) = req.parse(buf)? else {
        return Ok(None);
    };

    let header = |name: &str| {
        req.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(str::trim)
    };
    let upgrade_websocket = header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    // `Connection` is a token list, e.g. `keep-alive, Upgrade`.
    let connection_upgrade = header("connection")
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
    let websocket_key = header("sec-websocket-key").map(str::to_string);
    let websocket_version = header("sec-websocket-version").map(str::to_string);

    let target = req.path.unwrap_or("/");
    let path = target.split('?').next().unwrap_or("/").to_string();

    Ok(Some(RequestHead {
        method: req.method.unwrap_or("").to_string(),
        path,
        len,
        upgrade_websocket,
        connection_upgrade,
        websocket_key,
        websocket_version,
    }))
}

/// Wait until a complete request head is buffered on the socket, without
/// consuming it. `None` means the peer closed first.
async fn peek_request_head(stream: &TcpStream) -> Result<Option<RequestHead>, RelayError> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(head) = parse_request_head(&buf[..n])? {
            return Ok(Some(head));
        }
        if n == buf.len() {
            return Err(RelayError::HeadTooLarge);
        }
        // Peek returns immediately while unread bytes remain.
        tokio::time::sleep(PEEK_RETRY).await;
    }
}

/// Discard exactly the request head so the response is not followed by a reset.
async fn consume_head(stream: &mut TcpStream, head: &RequestHead) -> Result<(), RelayError> {
    let mut buf = vec![0u8; head.len];
    stream.read_exact(&mut buf).await?;
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, ctx: Arc<Context>) -> Result<(), RelayError> {
    let head = match tokio::time::timeout(HEAD_TIMEOUT, peek_request_head(&stream)).await {
        Ok(Ok(Some(head))) => head,
        Ok(Ok(None)) | Err(_) => return Ok(()),
        Ok(Err(RelayError::HeadTooLarge)) => {
            let mut discard = vec![0u8; MAX_REQUEST_HEAD];
            stream.read_exact(&mut discard).await?;
            return write_response(&mut stream, "431 Request Header Fields Too Large", "text/plain", b"Request Header Fields Too Large").await;
        }
        Ok(Err(RelayError::Http(e))) => {
            write_response(&mut stream, "400 Bad Request", "text/plain", b"Bad Request").await?;
            return Err(RelayError::Http(e));
        }
        Ok(Err(e)) => return Err(e),
    };

    if head.method == "GET" && head.path == WS_PATH {
        match head.check_upgrade() {
            Ok(()) => {
                // The handshake reads the head itself; nothing has been consumed.
                let ws = tokio_tungstenite::accept_async(stream).await?;
                return crate::session::run(ws, ctx.hub.clone(), ctx.limits).await;
            }
            Err(rejection) => {
                debug!(?rejection, "refused WebSocket upgrade");
                consume_head(&mut stream, &head).await?;
                return match rejection {
                    UpgradeRejection::BadRequest => {
                        write_response(&mut stream, "400 Bad Request", "text/plain", b"Expected a WebSocket upgrade").await
                    }
                    UpgradeRejection::UnsupportedVersion => write_upgrade_required(&mut stream).await,
                };
            }
        }
    }

    consume_head(&mut stream, &head).await?;

    if head.method != "GET" {
        return write_response(&mut stream, "405 Method Not Allowed", "text/plain", b"Method Not Allowed").await;
    }

    if head.path == "/" {
        return match tokio::fs::read(ctx.static_dir.join("index.html")).await {
            Ok(body) => write_response(&mut stream, "200 OK", "text/html; charset=utf-8", &body).await,
            Err(_) => {
                write_response(&mut stream, "200 OK", "text/html; charset=utf-8", INDEX_HTML.as_bytes()).await
            }
        };
    }

    let Some(path) = resolve_static(&ctx.static_dir, &head.path) else {
        warn!(path = %head.path, "rejected static path");
        return write_response(&mut stream, "404 Not Found", "text/plain", b"Not Found").await;
    };
    let path = if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
        path.join("index.html")
    } else {
        path
    };
    match tokio::fs::read(&path).await {
        Ok(body) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            write_response(&mut stream, "200 OK", mime.essence_str(), &body).await
        }
        Err(_) => write_response(&mut stream, "404 Not Found", "text/plain", b"Not Found").await,
    }
}

async fn write_upgrade_required(stream: &mut TcpStream) -> Result<(), RelayError> {
    let body = b"Unsupported WebSocket version";
    let head = format!(
        "HTTP/1.1 426 Upgrade Required\r\nSec-WebSocket-Version: 13\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len(),
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn write_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> Result<(), RelayError> {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len(),
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Percent-decoding for request paths.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            let hex = [bytes[i + 1], bytes[i + 2]];
            if let Some(byte) = std::str::from_utf8(&hex)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Map a request path onto a file under `root`, refusing anything that would
/// escape it.
pub fn resolve_static(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = url_decode(request_path);
    if decoded.contains('\\') || decoded.contains('\0') {
        return None;
    }
    let mut resolved = root.to_path_buf();
    for component in Path::new(decoded.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- url_decode --

    #[test]
    fn test_url_decode_basic() {
        assert_eq!(url_decode("hello%20world"), "hello world");
        assert_eq!(url_decode("a%26b"), "a&b");
        assert_eq!(url_decode("plain"), "plain");
    }

    #[test]
    fn test_url_decode_utf8_sequence() {
        assert_eq!(url_decode("caf%C3%A9"), "café");
    }

    #[test]
    fn test_url_decode_truncated_escape_kept() {
        assert_eq!(url_decode("abc%2"), "abc%2");
        assert_eq!(url_decode("%"), "%");
        assert_eq!(url_decode("%zz"), "%zz");
    }

    // -- resolve_static --

    #[test]
    fn test_resolve_static_simple() {
        let root = Path::new("/srv/public");
        assert_eq!(
            resolve_static(root, "/css/style.css"),
            Some(PathBuf::from("/srv/public/css/style.css"))
        );
    }

    #[test]
    fn test_resolve_static_rejects_traversal() {
        let root = Path::new("/srv/public");
        assert_eq!(resolve_static(root, "/../etc/passwd"), None);
        assert_eq!(resolve_static(root, "/a/%2e%2e/%2e%2e/etc/passwd"), None);
        assert_eq!(resolve_static(root, "/a\\..\\b"), None);
    }

    #[test]
    fn test_resolve_static_ignores_dot_segments() {
        let root = Path::new("/srv/public");
        assert_eq!(
            resolve_static(root, "/./app.js"),
            Some(PathBuf::from("/srv/public/app.js"))
        );
    }

    // -- parse_request_head --

    #[test]
    fn test_parse_request_head_plain_get() {
        let head = parse_request_head(b"GET /index.html?x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/index.html");
        assert!(!head.upgrade_websocket);
        assert!(head.websocket_key.is_none());
        assert_eq!(head.len, 49);
    }

    #[test]
    fn test_parse_request_head_websocket_upgrade() {
        let raw = b"GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let head = parse_request_head(raw).unwrap().unwrap();
        assert_eq!(head.path, "/ws");
        assert!(head.upgrade_websocket);
        assert_eq!(head.websocket_key.as_deref(), Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert_eq!(head.websocket_version.as_deref(), Some("13"));
        assert!(head.connection_upgrade);
    }

    #[test]
    fn test_parse_request_head_partial() {
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());
    }

    #[test]
    fn test_parse_request_head_garbage_is_error() {
        assert!(parse_request_head(b"\x01\x02 nonsense\r\n\r\n").is_err());
    }

    fn upgrade_head(extra: &str) -> RequestHead {
        let raw = format!(
            "GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n{extra}\r\n"
        );
        parse_request_head(raw.as_bytes()).unwrap().unwrap()
    }

    #[test]
    fn test_check_upgrade_accepts_valid_handshake() {
        let head = upgrade_head("Connection: keep-alive, Upgrade\r\nSec-WebSocket-Version: 13\r\n");
        assert!(head.connection_upgrade);
        assert_eq!(head.check_upgrade(), Ok(()));
    }

    #[test]
    fn test_check_upgrade_rejects_old_version() {
        let head = upgrade_head("Connection: Upgrade\r\nSec-WebSocket-Version: 8\r\n");
        assert_eq!(head.check_upgrade(), Err(UpgradeRejection::UnsupportedVersion));
        let head = upgrade_head("Connection: Upgrade\r\n");
        assert_eq!(head.check_upgrade(), Err(UpgradeRejection::UnsupportedVersion));
    }

    #[test]
    fn test_check_upgrade_requires_connection_upgrade() {
        let head = upgrade_head("Sec-WebSocket-Version: 13\r\n");
        assert!(!head.connection_upgrade);
        assert_eq!(head.check_upgrade(), Err(UpgradeRejection::BadRequest));
    }

    #[test]
    fn test_check_upgrade_plain_get_is_bad_request() {
        let head = parse_request_head(b"GET /ws HTTP/1.1\r\nHost: x\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.check_upgrade(), Err(UpgradeRejection::BadRequest));
    }

    // -- INDEX_HTML --

    #[test]
    fn test_index_html_is_valid_html() {
        assert!(INDEX_HTML.starts_with("<!DOCTYPE html>"));
        assert!(INDEX_HTML.trim_end().ends_with("</html>"));
    }

    #[test]
    fn test_index_html_speaks_protocol() {
        for event in ["previousMessages", "'message'", "'typing'", "'stopTyping'", "userLeft"] {
            assert!(INDEX_HTML.contains(event), "missing handler for {event}");
        }
        assert!(INDEX_HTML.contains("/ws"));
    }

    #[test]
    fn test_index_html_renders_text_safely() {
        assert!(INDEX_HTML.contains("textContent=m.text"));
        assert!(!INDEX_HTML.contains("innerHTML=contentHTML"));
    }

    #[test]
    fn test_index_html_no_external_deps() {
        assert!(!INDEX_HTML.contains("cdn."));
        assert!(!INDEX_HTML.contains("<script src"));
    }
}
