//! Request engine.
//!
//! A [`RequestSession`] speaks HTTP/1.1 over at most one transport connection,
//! reusing it while keep-alive limits allow, re-establishing it after
//! failures according to the reconnect policy, and following redirects up to
//! a configured bound.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::Method;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tokio::time::sleep;
use url::Url;

use crate::challenges::user_agents::random_user_agent;
use crate::config::{ConfigError, SessionConfig};
use crate::error::{HttpError, HttpResult, ProtocolError, TransportError};
use crate::modules::connection::{TlsVerification, TransportConnection};
use crate::modules::cookies::{CookieJar, CookieStore};
use crate::modules::proxy::{Credentials, ProxyTunnel, Timeouts};
use crate::modules::wire::{self, HeaderList, KeepAliveHints, Response};

/// Per-call behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestMode {
	pub follow_redirects: bool,
	pub ignore_protocol_errors: bool,
}

impl RequestMode {
	/// Hand back raw intermediate responses: no redirects, no status errors.
	pub const MANUAL: Self = Self {
		follow_redirects: false,
		ignore_protocol_errors: true,
	};

	pub fn from_config(config: &SessionConfig) -> Self {
		Self {
			follow_redirects: config.allow_auto_redirect,
			ignore_protocol_errors: config.ignore_protocol_errors,
		}
	}
}

/// Request payload with its media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBody {
	content_type: String,
	data: Bytes,
}

impl RequestBody {
	pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
		Self {
			content_type: content_type.into(),
			data: data.into(),
		}
	}

	pub fn text(text: impl Into<String>) -> Self {
		Self::new("text/plain; charset=utf-8", text.into())
	}

	/// `application/x-www-form-urlencoded` body.
	pub fn form<I, K, V>(pairs: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: AsRef<str>,
		V: AsRef<str>,
	{
		let mut serializer = url::form_urlencoded::Serializer::new(String::new());
		for (key, value) in pairs {
			serializer.append_pair(key.as_ref(), value.as_ref());
		}
		Self::new("application/x-www-form-urlencoded", serializer.finish())
	}

	pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
		Ok(Self::new("application/json", serde_json::to_vec(value)?))
	}

	pub fn content_type(&self) -> &str {
		&self.content_type
	}

	pub fn data(&self) -> &[u8] {
		&self.data
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}
}

/// Parameters attached for the next call only.
#[derive(Debug, Default)]
struct TransientParams {
	url_params: Vec<(String, String)>,
	form_params: Vec<(String, String)>,
	headers: HeaderList,
}

/// One logical HTTP client.
///
/// Not meant for concurrent use; run independent sessions for parallelism.
pub struct RequestSession {
	config: SessionConfig,
	base_address: Option<Url>,
	headers: HeaderList,
	cookies: Arc<dyn CookieStore>,
	proxy: Option<ProxyTunnel>,
	credentials: Option<Credentials>,
	tls: TlsVerification,
	rng: StdRng,

	connection: Option<TransportConnection>,
	connection_proxy: Option<ProxyTunnel>,
	last_failed: bool,
	server_hints: KeepAliveHints,
	keep_alive_requests: u32,
	idle_since: Option<Instant>,
	reconnect_count: u32,
	keep_alive_reconnected: bool,
	redirects: u32,

	transient: TransientParams,
}

impl fmt::Debug for RequestSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RequestSession")
			.field("base_address", &self.base_address)
			.field("proxy", &self.proxy)
			.field("connection", &self.connection)
			.field("keep_alive_requests", &self.keep_alive_requests)
			.finish_non_exhaustive()
	}
}

impl Default for RequestSession {
	fn default() -> Self {
		Self::from_parts(SessionConfig::default(), None, SessionBuilder::default())
	}
}

impl RequestSession {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn builder() -> SessionBuilder {
		SessionBuilder::new()
	}

	fn from_parts(config: SessionConfig, base_address: Option<Url>, builder: SessionBuilder) -> Self {
		let rng = match builder.seed {
			Some(seed) => StdRng::seed_from_u64(seed),
			None => StdRng::from_entropy(),
		};
		let mut headers = builder.headers;
		if let Some(user_agent) = builder.user_agent {
			headers.set("User-Agent", user_agent);
		}

		Self {
			config,
			base_address,
			headers,
			cookies: builder.cookies.unwrap_or_else(|| Arc::new(CookieJar::new())),
			proxy: builder.proxy,
			credentials: builder.credentials,
			tls: builder.tls,
			rng,
			connection: None,
			connection_proxy: None,
			last_failed: false,
			server_hints: KeepAliveHints::default(),
			keep_alive_requests: 0,
			idle_since: None,
			reconnect_count: 0,
			keep_alive_reconnected: false,
			redirects: 0,
			transient: TransientParams::default(),
		}
	}

	pub fn config(&self) -> &SessionConfig {
		&self.config
	}

	pub fn config_mut(&mut self) -> &mut SessionConfig {
		&mut self.config
	}

	pub fn base_address(&self) -> Option<&Url> {
		self.base_address.as_ref()
	}

	pub fn set_base_address(&mut self, base: Option<Url>) {
		self.base_address = base;
	}

	/// Persistent header sent with every request.
	pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.headers.set(name, value);
	}

	pub fn remove_header(&mut self, name: &str) -> Option<String> {
		self.headers.remove(name)
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(name)
	}

	pub fn headers(&self) -> &HeaderList {
		&self.headers
	}

	pub fn user_agent(&self) -> Option<&str> {
		self.headers.get("User-Agent")
	}

	pub fn set_user_agent(&mut self, user_agent: impl Into<String>) {
		self.headers.set("User-Agent", user_agent);
	}

	/// Assign a random browser user agent unless one is already set.
	pub fn ensure_user_agent(&mut self) {
		if self.user_agent().is_none() {
			let user_agent = random_user_agent(&mut self.rng);
			self.headers.set("User-Agent", user_agent);
		}
	}

	pub fn cookies(&self) -> &Arc<dyn CookieStore> {
		&self.cookies
	}

	pub fn set_cookie_store(&mut self, cookies: Arc<dyn CookieStore>) {
		self.cookies = cookies;
	}

	pub fn proxy(&self) -> Option<&ProxyTunnel> {
		self.proxy.as_ref()
	}

	/// Changing the proxy forces a new connection on the next request.
	pub fn set_proxy(&mut self, proxy: Option<ProxyTunnel>) {
		self.proxy = proxy;
	}

	pub fn set_credentials(&mut self, credentials: Option<Credentials>) {
		self.credentials = credentials;
	}

	pub fn set_tls_verification(&mut self, tls: TlsVerification) {
		self.tls = tls;
	}

	/// Session random source, used for user agents and chain shuffling.
	pub fn rng(&mut self) -> &mut StdRng {
		&mut self.rng
	}

	/// Redirects followed during the last call.
	pub fn redirect_count(&self) -> u32 {
		self.redirects
	}

	/// Reconnects spent by the last call.
	pub fn reconnect_count(&self) -> u32 {
		self.reconnect_count
	}

	/// Requests sent over the current connection.
	pub fn keep_alive_request_count(&self) -> u32 {
		self.keep_alive_requests
	}

	pub fn is_connected(&self) -> bool {
		self.connection.is_some()
	}

	/// Query parameter appended to the next request only.
	pub fn add_url_param(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
		self.transient.url_params.push((name.into(), value.into()));
		self
	}

	/// Form field sent as the body of the next request when no body is given.
	pub fn add_param(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
		self.transient.form_params.push((name.into(), value.into()));
		self
	}

	/// Header sent with the next request only; overrides persistent headers.
	pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
		self.transient.headers.set(name, value);
		self
	}

	pub async fn get(&mut self, address: &str) -> HttpResult<Response> {
		self.send(Method::GET, address, None).await
	}

	pub async fn post(&mut self, address: &str, body: Option<RequestBody>) -> HttpResult<Response> {
		self.send(Method::POST, address, body).await
	}

	/// Send one request using the session's configured redirect and status policy.
	pub async fn send(&mut self, method: Method, address: &str, body: Option<RequestBody>) -> HttpResult<Response> {
		let mode = RequestMode::from_config(&self.config);
		self.send_with_mode(method, address, body, mode).await
	}

	pub async fn send_with_mode(
		&mut self,
		method: Method,
		address: &str,
		body: Option<RequestBody>,
		mode: RequestMode,
	) -> HttpResult<Response> {
		// Transient parameters belong to this call, whatever its outcome.
		let transient = std::mem::take(&mut self.transient);
		self.redirects = 0;
		self.reconnect_count = 0;
		self.keep_alive_reconnected = false;

		let mut url = self.resolve_address(address)?;
		if !transient.url_params.is_empty() {
			url.query_pairs_mut().extend_pairs(transient.url_params.iter());
		}
		let mut body = match body {
			Some(body) => Some(body),
			None if !transient.form_params.is_empty() => Some(RequestBody::form(transient.form_params)),
			None => None,
		};
		let mut one_shot = transient.headers;
		let mut method = method;

		loop {
			let response = self.execute(&method, &url, body.as_ref(), &one_shot).await?;

			if !mode.ignore_protocol_errors
				&& let Some(err) = ProtocolError::from_status(response.status())
			{
				return Err(err.into());
			}

			let next = response.redirect_address().filter(|_| mode.follow_redirects).cloned();
			let Some(next) = next else {
				return Ok(response);
			};

			self.redirects += 1;
			if self.redirects > self.config.max_redirects {
				return Err(ProtocolError::TooManyRedirects {
					max: self.config.max_redirects,
				}
				.into());
			}
			log::debug!("redirect {} -> {}", url, next);
			url = next;
			method = Method::GET;
			body = None;
			one_shot.clear();
		}
	}

	/// Drop the current connection, shutting it down politely.
	pub async fn close(&mut self) {
		if let Some(connection) = self.connection.take() {
			connection.shutdown().await;
		}
	}

	/// One request/response exchange with the reconnect policy applied.
	async fn execute(
		&mut self,
		method: &Method,
		url: &Url,
		body: Option<&RequestBody>,
		one_shot: &HeaderList,
	) -> HttpResult<Response> {
		loop {
			let reused = match self.ensure_connection(url).await {
				Ok(reused) => reused,
				Err(err) => {
					if self.should_reconnect(&err).await {
						continue;
					}
					return Err(err);
				}
			};

			match self.exchange(method, url, body, one_shot).await {
				Ok(response) => {
					self.finish_exchange(url, &response);
					return Ok(response);
				}
				Err(err) => {
					self.last_failed = true;
					self.connection = None;

					// A reused connection the server already closed shows up as
					// an empty reply; retry once on a fresh one.
					if reused
						&& self.config.keep_alive
						&& !self.keep_alive_reconnected
						&& matches!(err, HttpError::Protocol(ProtocolError::EmptyResponse))
					{
						self.keep_alive_reconnected = true;
						log::debug!("{url}: keep-alive connection dropped by server, reconnecting");
						continue;
					}

					if self.should_reconnect(&err).await {
						continue;
					}
					return Err(err);
				}
			}
		}
	}

	async fn should_reconnect(&mut self, err: &HttpError) -> bool {
		self.last_failed = true;
		self.connection = None;

		if !self.config.reconnect || self.reconnect_count >= self.config.reconnect_limit || !err.is_retryable() {
			return false;
		}
		self.reconnect_count += 1;
		log::warn!(
			"request failed ({err}), reconnect {}/{} in {:?}",
			self.reconnect_count,
			self.config.reconnect_limit,
			self.config.reconnect_delay
		);
		sleep(self.config.reconnect_delay).await;
		true
	}

	/// Returns whether the existing connection was reused.
	async fn ensure_connection(&mut self, url: &Url) -> HttpResult<bool> {
		let reusable = self.config.keep_alive
			&& !self.last_failed
			&& self.connection_proxy == self.proxy
			&& self.connection.as_ref().is_some_and(|connection| connection.targets(url))
			&& !self.keep_alive_exhausted();

		if reusable {
			self.keep_alive_requests += 1;
			return Ok(true);
		}

		self.connection = None;
		let tunnel = self.active_tunnel();
		let connection =
			TransportConnection::open(&tunnel, url, &self.tls, self.config.read_write_timeout, &mut self.rng).await?;

		self.connection = Some(connection);
		self.connection_proxy = self.proxy.clone();
		self.server_hints = KeepAliveHints::default();
		self.keep_alive_requests = 1;
		self.last_failed = false;
		Ok(false)
	}

	fn keep_alive_exhausted(&self) -> bool {
		let max = self.server_hints.max.unwrap_or(self.config.max_keep_alive_requests);
		if self.keep_alive_requests >= max {
			return true;
		}
		let timeout = self.server_hints.timeout.unwrap_or(self.config.keep_alive_timeout);
		self.idle_since.is_none_or(|idle| idle.elapsed() >= timeout)
	}

	fn active_tunnel(&self) -> ProxyTunnel {
		self.proxy.clone().unwrap_or_else(|| {
			ProxyTunnel::Direct(Timeouts {
				connect: self.config.connect_timeout,
				read_write: self.config.read_write_timeout,
			})
		})
	}

	async fn exchange(
		&mut self,
		method: &Method,
		url: &Url,
		body: Option<&RequestBody>,
		one_shot: &HeaderList,
	) -> HttpResult<Response> {
		let body = body.filter(|_| wire::may_carry_body(method));
		let headers = self.build_headers(method, url, body, one_shot);
		let head = wire::request_head(method, url, &headers);
		let payload = body.map(RequestBody::data).unwrap_or_default();

		log::debug!("-> {} {}", method, url);
		let connection = self.connection.as_mut().ok_or_else(|| TransportError::Io {
			address: wire::host_header(url),
			source: std::io::Error::new(std::io::ErrorKind::NotConnected, "no open connection"),
		})?;
		connection.exchange(method, url, &head, payload).await
	}

	fn finish_exchange(&mut self, url: &Url, response: &Response) {
		self.last_failed = false;
		self.reconnect_count = 0;
		self.keep_alive_reconnected = false;
		self.idle_since = Some(Instant::now());

		let hints = response.keep_alive();
		if hints.timeout.is_some() {
			self.server_hints.timeout = hints.timeout;
		}
		if hints.max.is_some() {
			self.server_hints.max = hints.max;
		}
		if hints.close || !self.config.keep_alive {
			self.connection = None;
		}

		let set_cookies = response.set_cookie_headers();
		if !set_cookies.is_empty() {
			self.cookies.store_response_cookies(url, &set_cookies);
		}
	}

	/// Header block in wire order: computed headers, then persistent ones,
	/// then one-shot ones, then cookies when not set explicitly.
	fn build_headers(
		&self,
		method: &Method,
		url: &Url,
		body: Option<&RequestBody>,
		one_shot: &HeaderList,
	) -> HeaderList {
		let mut headers = HeaderList::new();
		headers.set("Host", wire::host_header(url));

		let connection = if self.config.keep_alive { "keep-alive" } else { "close" };
		let http_proxy = self
			.proxy
			.as_ref()
			.and_then(ProxyTunnel::http_proxy)
			.and_then(|proxy| proxy.credentials.as_ref());
		match http_proxy {
			Some(credentials) => {
				headers.set("Proxy-Connection", connection);
				headers.set("Proxy-Authorization", basic_auth(credentials));
			}
			None => headers.set("Connection", connection),
		}

		if let Some(credentials) = &self.credentials {
			headers.set("Authorization", basic_auth(credentials));
		}
		if self.config.enable_encoding {
			headers.set("Accept-Encoding", "gzip, deflate");
		}
		if let Some(culture) = &self.config.culture {
			headers.set("Accept-Language", wire::accept_language(culture));
		}
		if let Some(charset) = &self.config.charset {
			headers.set("Accept-Charset", wire::accept_charset(charset));
		}
		if wire::may_carry_body(method) {
			if let Some(body) = body.filter(|body| !body.is_empty()) {
				headers.set("Content-Type", body.content_type());
			}
			headers.set("Content-Length", body.map_or(0, RequestBody::len).to_string());
		}

		headers.merge(&self.headers);
		headers.merge(one_shot);

		if !headers.contains("Cookie")
			&& let Some(cookie) = self.cookies.cookie_header(url)
		{
			headers.set("Cookie", cookie);
		}
		headers
	}

	/// Absolute http(s) address, resolving relative ones against the base address.
	pub fn resolve_address(&self, address: &str) -> HttpResult<Url> {
		let invalid = |reason: String| HttpError::from(ProtocolError::InvalidAddress(reason));
		let url = match Url::parse(address) {
			Ok(url) => url,
			Err(url::ParseError::RelativeUrlWithoutBase) => {
				let base = self
					.base_address
					.as_ref()
					.ok_or_else(|| invalid(format!("relative address '{address}' without a base address")))?;
				base.join(address).map_err(|err| invalid(format!("{address}: {err}")))?
			}
			Err(err) => return Err(invalid(format!("{address}: {err}"))),
		};

		if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
			return Err(invalid(format!("'{address}' is not an http(s) address")));
		}
		Ok(url)
	}
}

fn basic_auth(credentials: &Credentials) -> String {
	let token = STANDARD.encode(format!("{}:{}", credentials.username, credentials.password));
	format!("Basic {token}")
}

/// Fluent constructor for [`RequestSession`].
#[derive(Default)]
pub struct SessionBuilder {
	config: SessionConfig,
	proxy: Option<ProxyTunnel>,
	cookies: Option<Arc<dyn CookieStore>>,
	tls: TlsVerification,
	credentials: Option<Credentials>,
	user_agent: Option<String>,
	headers: HeaderList,
	seed: Option<u64>,
}

impl SessionBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_config(mut self, config: SessionConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_proxy(mut self, proxy: ProxyTunnel) -> Self {
		self.proxy = Some(proxy);
		self
	}

	pub fn with_cookie_store(mut self, cookies: Arc<dyn CookieStore>) -> Self {
		self.cookies = Some(cookies);
		self
	}

	pub fn with_tls_verification(mut self, tls: TlsVerification) -> Self {
		self.tls = tls;
		self
	}

	pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
		self.credentials = Some(Credentials::new(username, password));
		self
	}

	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.user_agent = Some(user_agent.into());
		self
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.set(name, value);
		self
	}

	/// Fixed seed for the session random source.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}

	pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
		self.config.keep_alive_timeout = timeout;
		self
	}

	pub fn build(self) -> Result<RequestSession, ConfigError> {
		self.config.validate()?;
		let config = self.config.clone();
		let base_address = config.parsed_base_address()?;
		Ok(RequestSession::from_parts(config, base_address, self))
	}
}
