//! `X-Forwarded-*`, RFC 7239 `Forwarded` and client certificate transforms.
use std::{net::SocketAddr, str::FromStr};

use http::{HeaderName, HeaderValue, header};
use rand::{Rng, distr::Alphanumeric};

use crate::{
    config::models::TransformValues,
    core::transforms::{
        builder::{
            Contribution, TransformBuildError, TransformBuilderContext, TransformFactory,
            TransformRouteValidationContext, check_parameter_count, parse_header_name,
        },
        chain::RequestTransform,
        context::RequestTransformContext,
        headers::{add_values, inbound_host, take_header},
    },
};

const X_FORWARDED: &str = "X-Forwarded";
const FORWARDED: &str = "Forwarded";
const CLIENT_CERT: &str = "ClientCert";
const FOR: &str = "For";
const HOST: &str = "Host";
const PROTO: &str = "Proto";
const PREFIX: &str = "Prefix";
const HEADER_PREFIX: &str = "HeaderPrefix";
const FOR_FORMAT: &str = "ForFormat";
const BY_FORMAT: &str = "ByFormat";
const ACTION: &str = "Action";
const DEFAULT_X_FORWARDED_PREFIX: &str = "X-Forwarded-";
const OBFUSCATED_NODE_LENGTH: usize = 9;

/// What a forwarding header transform does with existing values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ForwardedAction {
    Off,
    /// Replace any existing values
    #[default]
    Set,
    /// Keep existing values and add ours after them
    Append,
    Remove,
}

impl FromStr for ForwardedAction {
    type Err = TransformBuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "set" => Ok(Self::Set),
            "append" => Ok(Self::Append),
            "remove" => Ok(Self::Remove),
            _ => Err(TransformBuildError::InvalidValue {
                key: ACTION.to_string(),
                value: s.to_string(),
                expected: "'Off', 'Set', 'Append' or 'Remove'".to_string(),
            }),
        }
    }
}

/// Which `X-Forwarded-*` header a transform maintains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XForwardedKind {
    For,
    Host,
    Prefix,
    Proto,
}

impl XForwardedKind {
    /// Order the default transforms are appended in
    pub const ALL: [XForwardedKind; 4] = [Self::For, Self::Host, Self::Prefix, Self::Proto];

    fn suffix(&self) -> &'static str {
        match self {
            Self::For => FOR,
            Self::Host => HOST,
            Self::Prefix => PREFIX,
            Self::Proto => PROTO,
        }
    }

    pub fn default_header(&self) -> HeaderName {
        HeaderName::from_static(match self {
            Self::For => "x-forwarded-for",
            Self::Host => "x-forwarded-host",
            Self::Prefix => "x-forwarded-prefix",
            Self::Proto => "x-forwarded-proto",
        })
    }

    pub fn transform(&self, action: ForwardedAction) -> RequestTransform {
        RequestTransform::XForwarded {
            kind: *self,
            header: self.default_header(),
            action,
        }
    }

    pub(crate) fn apply(
        &self,
        context: &mut RequestTransformContext<'_>,
        header: &HeaderName,
        action: ForwardedAction,
    ) {
        let value = match self {
            Self::For => context.connection.remote_addr.map(|a| a.ip().to_string()),
            Self::Host => inbound_host(context.inbound),
            Self::Prefix => Some(context.connection.path_base.clone()).filter(|p| !p.is_empty()),
            Self::Proto => Some(context.connection.scheme().to_string()),
        }
        .and_then(|v| HeaderValue::from_str(&v).ok());

        match action {
            ForwardedAction::Off => {}
            ForwardedAction::Remove => {
                context.proxy_request.headers.remove(header);
            }
            ForwardedAction::Set => {
                take_header(context, header);
                if let Some(value) = value {
                    context.proxy_request.headers.insert(header.clone(), value);
                }
            }
            ForwardedAction::Append => {
                let mut values = take_header(context, header);
                values.extend(value);
                add_values(&mut context.proxy_request.headers, header, values);
            }
        }
    }
}

/// How a node (`for=` / `by=`) is written into a `Forwarded` header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum NodeFormat {
    None,
    #[default]
    Random,
    RandomAndPort,
    Unknown,
    UnknownAndPort,
    Ip,
    IpAndPort,
}

impl NodeFormat {
    fn parse(key: &str, raw: &str) -> Result<Self, TransformBuildError> {
        match raw.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "random" => Ok(Self::Random),
            "randomandport" => Ok(Self::RandomAndPort),
            "unknown" => Ok(Self::Unknown),
            "unknownandport" => Ok(Self::UnknownAndPort),
            "ip" => Ok(Self::Ip),
            "ipandport" => Ok(Self::IpAndPort),
            _ => Err(TransformBuildError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
                expected: "'None', 'Random', 'RandomAndPort', 'Unknown', 'UnknownAndPort', \
                           'Ip' or 'IpAndPort'"
                    .to_string(),
            }),
        }
    }

    fn format(&self, addr: Option<SocketAddr>) -> Option<String> {
        let port = addr.map(|a| a.port());
        let node = match self {
            Self::None => return None,
            Self::Random => return Some(obfuscated_node()),
            Self::RandomAndPort => with_port(obfuscated_node(), port),
            Self::Unknown => return Some("unknown".to_string()),
            Self::UnknownAndPort => with_port("unknown".to_string(), port),
            Self::Ip => match addr {
                Some(SocketAddr::V4(a)) => return Some(a.ip().to_string()),
                Some(SocketAddr::V6(a)) => format!("[{}]", a.ip()),
                None => return Some("unknown".to_string()),
            },
            Self::IpAndPort => match addr {
                Some(SocketAddr::V4(a)) => a.to_string(),
                Some(SocketAddr::V6(a)) => format!("[{}]:{}", a.ip(), a.port()),
                None => return Some("unknown".to_string()),
            },
        };
        Some(quote(&node))
    }
}

fn obfuscated_node() -> String {
    let token: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(OBFUSCATED_NODE_LENGTH)
        .map(char::from)
        .collect();
    format!("_{token}")
}

fn with_port(node: String, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{node}:{port}"),
        None => node,
    }
}

// Values containing ':' or '[' are not RFC 7230 tokens and must be quoted.
fn quote(value: &str) -> String {
    if value.contains([':', '[']) {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

/// RFC 7239 `Forwarded` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedTransform {
    pub for_format: NodeFormat,
    pub by_format: NodeFormat,
    pub host: bool,
    pub proto: bool,
    pub action: ForwardedAction,
}

impl ForwardedTransform {
    /// Strips any `Forwarded` header the client sent
    pub fn remove() -> Self {
        Self {
            for_format: NodeFormat::None,
            by_format: NodeFormat::None,
            host: false,
            proto: false,
            action: ForwardedAction::Remove,
        }
    }

    pub(crate) fn apply(&self, context: &mut RequestTransformContext<'_>) {
        match self.action {
            ForwardedAction::Off => {}
            ForwardedAction::Remove => {
                context.proxy_request.headers.remove(header::FORWARDED);
            }
            ForwardedAction::Set | ForwardedAction::Append => {
                let mut values = take_header(context, &header::FORWARDED);
                if self.action == ForwardedAction::Set {
                    values.clear();
                }
                if let Some(value) = self
                    .element(context)
                    .and_then(|e| HeaderValue::from_str(&e).ok())
                {
                    values.push(value);
                }
                add_values(&mut context.proxy_request.headers, &header::FORWARDED, values);
            }
        }
    }

    fn element(&self, context: &RequestTransformContext<'_>) -> Option<String> {
        let mut pairs = Vec::with_capacity(4);
        if self.proto {
            pairs.push(format!("proto={}", context.connection.scheme()));
        }
        if self.host {
            if let Some(host) = inbound_host(context.inbound) {
                pairs.push(format!("host=\"{host}\""));
            }
        }
        if let Some(node) = self.for_format.format(context.connection.remote_addr) {
            pairs.push(format!("for={node}"));
        }
        if let Some(node) = self.by_format.format(context.connection.local_addr) {
            pairs.push(format!("by={node}"));
        }
        (!pairs.is_empty()).then(|| pairs.join(";"))
    }
}

/// Claims `X-Forwarded`, `Forwarded` and `ClientCert`
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardedTransformFactory;

impl ForwardedTransformFactory {
    fn parse(
        &self,
        values: &TransformValues,
    ) -> Option<Result<Vec<Contribution>, TransformBuildError>> {
        if let Some(raw) = values.get(X_FORWARDED) {
            return Some(x_forwarded(values, raw));
        }
        if let Some(raw) = values.get(FORWARDED) {
            return Some(forwarded(values, raw));
        }
        if let Some(raw) = values.get(CLIENT_CERT) {
            return Some(
                check_parameter_count(values, 1)
                    .and_then(|_| parse_header_name(raw))
                    .map(|name| vec![Contribution::Request(RequestTransform::ClientCert(name))]),
            );
        }
        None
    }
}

impl TransformFactory for ForwardedTransformFactory {
    fn validate(
        &self,
        context: &mut TransformRouteValidationContext<'_>,
        values: &TransformValues,
    ) -> bool {
        context.check(self.parse(values))
    }

    fn build(&self, context: &mut TransformBuilderContext<'_>, values: &TransformValues) -> bool {
        context.contribute(self.parse(values))
    }
}

fn x_forwarded(
    values: &TransformValues,
    raw: &str,
) -> Result<Vec<Contribution>, TransformBuildError> {
    let expected = 1 + [FOR, HOST, PROTO, PREFIX, HEADER_PREFIX]
        .iter()
        .filter(|k| values.contains_key(k))
        .count();
    check_parameter_count(values, expected)?;

    let default_action: ForwardedAction = raw.parse()?;
    let prefix = values.get(HEADER_PREFIX).unwrap_or(DEFAULT_X_FORWARDED_PREFIX);

    let mut contributions = vec![Contribution::SuppressDefaultForwarders];
    for kind in XForwardedKind::ALL {
        let action = match values.get(kind.suffix()) {
            Some(raw) => raw.parse()?,
            None => default_action,
        };
        if action == ForwardedAction::Off {
            continue;
        }
        let header = parse_header_name(&format!("{prefix}{}", kind.suffix()))?;
        contributions.push(Contribution::Request(RequestTransform::XForwarded {
            kind,
            header,
            action,
        }));
    }
    Ok(contributions)
}

fn forwarded(values: &TransformValues, raw: &str) -> Result<Vec<Contribution>, TransformBuildError> {
    let expected = 1 + [FOR_FORMAT, BY_FORMAT, ACTION]
        .iter()
        .filter(|k| values.contains_key(k))
        .count();
    check_parameter_count(values, expected)?;

    let mut use_for = false;
    let mut use_by = false;
    let mut host = false;
    let mut proto = false;
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token.to_ascii_lowercase().as_str() {
            "for" => use_for = true,
            "by" => use_by = true,
            "host" => host = true,
            "proto" => proto = true,
            _ => {
                return Err(TransformBuildError::InvalidValue {
                    key: FORWARDED.to_string(),
                    value: token.to_string(),
                    expected: "'for', 'by', 'host' or 'proto'".to_string(),
                });
            }
        }
    }

    let for_format = match values.get(FOR_FORMAT) {
        Some(raw) => NodeFormat::parse(FOR_FORMAT, raw)?,
        None => NodeFormat::default(),
    };
    let by_format = match values.get(BY_FORMAT) {
        Some(raw) => NodeFormat::parse(BY_FORMAT, raw)?,
        None => NodeFormat::default(),
    };
    let action = match values.get(ACTION) {
        Some(raw) => raw.parse()?,
        None => ForwardedAction::Set,
    };

    if action == ForwardedAction::Off || !(use_for || use_by || host || proto) {
        return Ok(Vec::new());
    }

    Ok(vec![Contribution::Request(RequestTransform::Forwarded(
        ForwardedTransform {
            for_format: if use_for { for_format } else { NodeFormat::None },
            by_format: if use_by { by_format } else { NodeFormat::None },
            host,
            proto,
            action,
        },
    ))])
}
