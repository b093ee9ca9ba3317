//! The request front-end.
//!
//! [`Handler`] sits in front of one WebDAV verb handler per user. Every
//! request runs the same straight-line pipeline: authenticate, strip the
//! URL prefix from the request path and the Destination header, check the
//! user's permissions, massage the request (HEAD body suppression, GET on
//! a collection becomes PROPFIND), and delegate to the verb handler that
//! is rooted in the user's directory and lock namespace.
//!
//! The per-user verb handlers are built once at startup; there is no
//! cross-request state beyond the shared in-memory lock service.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::net::SocketAddr;

use bytes::Buf;
use dav_server::body::Body;
use dav_server::ls::DavLockSystem;
use dav_server::memls::MemLs;
use dav_server::DavHandler;
use headers::authorization::Basic;
use headers::{Authorization, HeaderMapExt};
use http::header::{HeaderValue, HOST, WWW_AUTHENTICATE, X_CONTENT_TYPE_OPTIONS};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body::Body as HttpBody;
use percent_encoding::percent_decode_str;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fs::WebdavFs;
use crate::ls::RebasedLs;
use crate::user::User;

/// Authenticating, authorizing WebDAV front-end.
pub struct Handler {
    prefix: String,
    no_sniff: bool,
    no_password: bool,
    behind_proxy: bool,
    anonymous: UserContext,
    users: HashMap<String, UserContext>,
}

// A user plus the verb handler preconfigured with their rooted
// filesystem and lock namespace.
struct UserContext {
    user: User,
    fs: WebdavFs,
    dav: DavHandler,
}

impl UserContext {
    fn new(user: User, locks: Box<dyn DavLockSystem>) -> UserContext {
        let fs = WebdavFs::new(&user.permissions.directory);
        let dav = DavHandler::builder()
            .filesystem(fs.backend())
            .locksystem(RebasedLs::new(locks, &user.permissions.directory))
            .build_handler();
        UserContext { user, fs, dav }
    }
}

impl Handler {
    pub fn new(config: &Config) -> Handler {
        if config.users.is_empty() {
            warn!("unprotected config: no users have been set, so no authentication will be used");
        }
        if config.no_password {
            warn!("unprotected config: password check is disabled, only intended when delegating authentication to another service");
        }

        // One lock service for the whole process; the per-user wrappers
        // rebase names under each root (see crate::ls).
        let locks: Box<dyn DavLockSystem> = MemLs::new();

        let anonymous = UserContext::new(
            User {
                username: String::new(),
                password: String::new(),
                permissions: config.permissions.clone(),
            },
            locks.clone(),
        );

        let mut users = HashMap::new();
        for user in &config.users {
            users.insert(
                user.username.clone(),
                UserContext::new(user.clone(), locks.clone()),
            );
        }

        Handler {
            prefix: config.prefix.clone(),
            no_sniff: config.no_sniff,
            no_password: config.no_password,
            behind_proxy: config.behind_proxy,
            anonymous,
            users,
        }
    }

    /// Runs the request pipeline and produces the response.
    pub async fn handle<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
        remote: Option<SocketAddr>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        let ctx = match self.authenticate(&req, remote) {
            Ok(ctx) => ctx,
            Err(response) => return response,
        };

        let request = match RequestContext::parse(&req, &self.prefix) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, method = %req.method(), path = req.uri().path(), "rejecting request");
                return forbidden();
            }
        };

        let allowed = ctx
            .user
            .permissions
            .allowed(
                req.method(),
                &request.path,
                request.destination.as_deref(),
                &ctx.fs,
            )
            .await;
        debug!(allowed, method = %req.method(), path = %request.path, "authorization");
        if !allowed {
            return forbidden();
        }

        let is_head = req.method() == Method::HEAD;

        // The verb handler is configured without a prefix; hand it the
        // stripped paths on both the request line and the Destination
        // header.
        let (mut parts, body) = req.into_parts();
        if let Some(uri) = rewrite_uri(&parts.uri, &request.raw_path) {
            parts.uri = uri;
        }
        if let Some(destination) = &request.raw_destination {
            if let Ok(value) = HeaderValue::from_str(destination) {
                parts.headers.insert("destination", value);
            }
        }

        // RFC 4918 §9.4: GET on a collection returns the same thing as
        // PROPFIND.
        if parts.method == Method::GET {
            if let Ok(meta) = ctx.fs.metadata(&request.path).await {
                if meta.is_dir() {
                    // A valid method token, cannot fail.
                    parts.method = Method::from_bytes(b"PROPFIND").unwrap();
                    if !parts.headers.contains_key("depth") {
                        parts.headers.insert("depth", HeaderValue::from_static("1"));
                    }
                }
            }
        }

        let mut response = ctx.dav.handle(Request::from_parts(parts, body)).await;

        if self.no_sniff {
            response
                .headers_mut()
                .insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        }
        if is_head {
            response = response.map(|_| Body::empty());
        }
        response
    }

    // Selects the user for this request. An empty user list means the
    // anonymous default user and no challenge.
    fn authenticate<B>(
        &self,
        req: &Request<B>,
        remote: Option<SocketAddr>,
    ) -> Result<&UserContext, Response<Body>> {
        if self.users.is_empty() {
            return Ok(&self.anonymous);
        }

        let remote_address = self.remote_addr(req.headers(), remote);

        let Some(Authorization(basic)) = req.headers().typed_get::<Authorization<Basic>>() else {
            return Err(unauthorized());
        };

        let Some(ctx) = self.users.get(basic.username()) else {
            info!(username = basic.username(), remote_address = %remote_address, "invalid username");
            return Err(unauthorized());
        };

        if !self.no_password && !ctx.user.check_password(basic.password()) {
            info!(username = basic.username(), remote_address = %remote_address, "invalid password");
            return Err(unauthorized());
        }

        info!(username = basic.username(), remote_address = %remote_address, "user authorized");
        Ok(ctx)
    }

    // Client address for logging. Behind a proxy the X-Forwarded-For
    // header is taken verbatim.
    fn remote_addr(&self, headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
        if self.behind_proxy {
            if let Some(forwarded) = headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
            {
                return forwarded.to_string();
            }
        }
        remote
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

fn unauthorized() -> Response<Body> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"Restricted\""),
        )
        .body(Body::from("Not authorized"))
        .unwrap()
}

fn forbidden() -> Response<Body> {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .body(Body::empty())
        .unwrap()
}

// The request paths after authentication-independent normalization:
// prefix-stripped, with both the raw (encoded) form for the verb handler
// and the decoded form the rules match against.
struct RequestContext {
    path: String,
    raw_path: String,
    destination: Option<String>,
    raw_destination: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("invalid url prefix")]
    PrefixMismatch,
    #[error("destination host does not match the request host")]
    ForeignDestination,
}

impl RequestContext {
    fn parse<B>(req: &Request<B>, prefix: &str) -> Result<RequestContext, RequestError> {
        let raw_path = strip_prefix(req.uri().path(), prefix)?;
        let path = decode(&raw_path);

        // Only COPY and MOVE give the Destination header meaning; other
        // verbs carry it through untouched.
        let raw_destination = if matches!(req.method().as_str(), "COPY" | "MOVE") {
            destination_path(req, prefix)?
        } else {
            None
        };
        let destination = raw_destination.as_deref().map(decode);

        Ok(RequestContext {
            path,
            raw_path,
            destination,
            raw_destination,
        })
    }
}

fn decode(path: &str) -> String {
    percent_decode_str(path).decode_utf8_lossy().into_owned()
}

// Strip the configured prefix and restore the leading slash. Stripping
// that does not shorten the path means the request was sent outside the
// mount point.
fn strip_prefix(path: &str, prefix: &str) -> Result<String, RequestError> {
    let stripped = path
        .strip_prefix(prefix)
        .ok_or(RequestError::PrefixMismatch)?;
    if stripped.starts_with('/') {
        Ok(stripped.to_string())
    } else {
        Ok(format!("/{stripped}"))
    }
}

// Extract the prefix-stripped path of the Destination header. A header
// that does not parse as a URL is ignored here; authorization then denies
// the verbs that depend on it. A destination pointing at another host is
// refused outright.
fn destination_path<B>(req: &Request<B>, prefix: &str) -> Result<Option<String>, RequestError> {
    let Some(value) = req
        .headers()
        .get("destination")
        .and_then(|value| value.to_str().ok())
    else {
        return Ok(None);
    };
    let Ok(uri) = value.parse::<Uri>() else {
        return Ok(None);
    };

    if let (Some(authority), Some(host)) = (uri.authority(), request_host(req)) {
        if !authority.as_str().eq_ignore_ascii_case(host) {
            return Err(RequestError::ForeignDestination);
        }
    }

    strip_prefix(uri.path(), prefix).map(Some)
}

fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().authority().map(|authority| authority.as_str()))
}

fn rewrite_uri(uri: &Uri, path: &str) -> Option<Uri> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse().ok()?);
    Uri::from_parts(parts).ok()
}
