//! SOAP control client for WANIPConnection / WANPPPConnection services

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use xmltree::{Element, XMLNode};

use super::{Candidate, PortMappingRequest, PortProtocol};
use crate::nat::error::{NatError, NatResult, UpnpError};

/// Actions understood by the control client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapAction {
    AddPortMapping,
    DeletePortMapping,
    GetExternalIPAddress,
    GetStatusInfo,
}

impl SoapAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddPortMapping => "AddPortMapping",
            Self::DeletePortMapping => "DeletePortMapping",
            Self::GetExternalIPAddress => "GetExternalIPAddress",
            Self::GetStatusInfo => "GetStatusInfo",
        }
    }
}

/// Raw HTTP reply
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP seam used for description fetches and SOAP posts
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// GET a document; non-2xx replies are errors
    async fn get(&self, url: &str) -> NatResult<String>;

    /// POST a SOAP envelope with the given SOAPACTION header value
    async fn post_soap(&self, url: &str, soap_action: &str, body: String) -> NatResult<HttpResponse>;
}

/// [`HttpTransport`] backed by reqwest
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> NatResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NatError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> NatResult<String> {
        let response = self.client.get(url)
            .send()
            .await
            .map_err(|e| UpnpError::Transport(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpnpError::HttpError {
                code: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            }
            .into());
        }

        let text = response.text()
            .await
            .map_err(|e| UpnpError::Transport(format!("Failed to read {}: {}", url, e)))?;
        Ok(text)
    }

    async fn post_soap(&self, url: &str, soap_action: &str, body: String) -> NatResult<HttpResponse> {
        let response = self.client.post(url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPACTION", soap_action)
            .body(body)
            .send()
            .await
            .map_err(|e| UpnpError::Transport(format!("SOAP request to {} failed: {}", url, e)))?;

        let status = response.status().as_u16();
        let body = response.text()
            .await
            .map_err(|e| UpnpError::Transport(format!("Failed to read SOAP response: {}", e)))?;

        Ok(HttpResponse { status, body })
    }
}

/// Quoted SOAPACTION header value for `service_urn`
pub fn soap_action_header(service_urn: &str, action: SoapAction) -> String {
    format!("\"{}#{}\"", service_urn, action.name())
}

/// Build the request envelope for one action
pub fn build_envelope(service_urn: &str, action: SoapAction, args: &[(&str, String)]) -> String {
    let mut params = String::new();
    for (name, value) in args {
        params.push_str(&format!("<{name}>{}</{name}>", escape_xml(value)));
    }

    format!(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body><u:{action} xmlns:u=\"{urn}\">{params}</u:{action}></s:Body>\
         </s:Envelope>",
        action = action.name(),
        urn = service_urn,
    )
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Find `<{action}Response>` inside the SOAP body
fn response_element(root: Element, action: SoapAction) -> NatResult<Element> {
    let expected = format!("{}Response", action.name());
    let body = root.get_child("Body")
        .ok_or_else(|| UpnpError::MissingField("Body".to_string()))?;

    body.children.iter()
        .find_map(|child| match child {
            XMLNode::Element(elem) if elem.name == expected => Some(elem.clone()),
            _ => None,
        })
        .ok_or_else(|| UpnpError::MissingField(expected).into())
}

/// Decode a `Fault/detail/UPnPError` body, if there is one
fn parse_fault(body: &str) -> Option<UpnpError> {
    let root = Element::parse(body.as_bytes()).ok()?;
    let fault = root.get_child("Body")?.get_child("Fault")?;
    let upnp_error = fault.get_child("detail")?.get_child("UPnPError")?;

    let code = upnp_error.get_child("errorCode")?
        .get_text()?
        .trim()
        .parse::<u16>()
        .ok()?;
    let description = upnp_error.get_child("errorDescription")
        .and_then(|d| d.get_text())
        .map(|d| d.trim().to_string())
        .unwrap_or_default();

    Some(UpnpError::fault(code, description))
}

/// Text of a required child node of a response element
fn field_text(response: &Element, field: &str) -> NatResult<String> {
    response.get_child(field)
        .and_then(|f| f.get_text())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| UpnpError::MissingField(field.to_string()).into())
}

/// Executes one SOAP action per call against a gateway control URL.
///
/// Never retries; every HTTP, fault or parse problem is returned to the caller.
#[derive(Clone)]
pub struct GatewayControlClient {
    http: Arc<dyn HttpTransport>,
}

impl GatewayControlClient {
    pub fn new(http: Arc<dyn HttpTransport>) -> Self {
        Self { http }
    }

    pub fn http(&self) -> &Arc<dyn HttpTransport> {
        &self.http
    }

    /// Send one action; any 2xx reply counts as success and its body is returned
    pub async fn send(
        &self,
        gateway: &Candidate,
        action: SoapAction,
        args: &[(&str, String)],
    ) -> NatResult<String> {
        let urn = gateway.service_urn();
        let envelope = build_envelope(&urn, action, args);
        let header = soap_action_header(&urn, action);

        tracing::trace!("SOAP {} -> {}", action.name(), gateway.control_url);
        let response = self.http.post_soap(&gateway.control_url, &header, envelope).await?;

        if !response.is_success() {
            if let Some(fault) = parse_fault(&response.body) {
                return Err(fault.into());
            }
            return Err(UpnpError::HttpError {
                code: response.status,
                reason: format!("{} rejected", action.name()),
            }
            .into());
        }

        Ok(response.body)
    }

    /// Send one action and return the parsed `<{action}Response>` element
    pub async fn call(
        &self,
        gateway: &Candidate,
        action: SoapAction,
        args: &[(&str, String)],
    ) -> NatResult<Element> {
        let body = self.send(gateway, action, args).await?;
        let root = Element::parse(body.as_bytes())
            .map_err(|e| UpnpError::XmlParseError(e.to_string()))?;
        response_element(root, action)
    }

    pub async fn add_port_mapping(
        &self,
        gateway: &Candidate,
        request: &PortMappingRequest,
        lease_duration: u32,
    ) -> NatResult<()> {
        let args = [
            ("NewRemoteHost", String::new()),
            ("NewExternalPort", request.external_port.to_string()),
            ("NewProtocol", request.protocol.as_str().to_string()),
            ("NewInternalPort", request.internal_port.to_string()),
            ("NewInternalClient", request.internal_client.to_string()),
            ("NewEnabled", "1".to_string()),
            ("NewPortMappingDescription", request.description.clone()),
            ("NewLeaseDuration", lease_duration.to_string()),
        ];
        self.send(gateway, SoapAction::AddPortMapping, &args).await?;
        Ok(())
    }

    /// Empty remote host matches a mapping for any remote host
    pub async fn delete_port_mapping(
        &self,
        gateway: &Candidate,
        external_port: u16,
        protocol: PortProtocol,
    ) -> NatResult<()> {
        let args = [
            ("NewRemoteHost", String::new()),
            ("NewExternalPort", external_port.to_string()),
            ("NewProtocol", protocol.as_str().to_string()),
        ];
        self.send(gateway, SoapAction::DeletePortMapping, &args).await?;
        Ok(())
    }

    pub async fn get_external_ip(&self, gateway: &Candidate) -> NatResult<Ipv4Addr> {
        let response = self.call(gateway, SoapAction::GetExternalIPAddress, &[]).await?;
        let text = field_text(&response, "NewExternalIPAddress")?;
        text.parse()
            .map_err(|_| UpnpError::InvalidResponse(format!("Invalid external IP '{}'", text)).into())
    }

    pub async fn get_status_info(&self, gateway: &Candidate) -> NatResult<String> {
        let response = self.call(gateway, SoapAction::GetStatusInfo, &[]).await?;
        field_text(&response, "NewConnectionStatus")
    }
}
