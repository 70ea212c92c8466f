//! Device description parsing: turns an IGD description document into a [`Candidate`]

use xmltree::{Element, XMLNode};

use super::soap::HttpTransport;
use super::{Candidate, ServiceType};
use crate::nat::error::{NatResult, UpnpError};

/// Marker that must appear in the root `deviceType`
const IGD_DEVICE_TYPE: &str = "InternetGatewayDevice";

/// Resolve a control URL against the gateway's description URL.
///
/// Sub-URLs containing `http:` or a `.` are taken as absolute. Anything else
/// is appended to the scheme and host of `gateway_url`; its port and path
/// are dropped.
pub fn combine_urls(gateway_url: &str, sub_url: &str) -> String {
    if sub_url.contains("http:") || sub_url.contains('.') {
        return sub_url.to_string();
    }

    let (scheme, host) = match url::Url::parse(gateway_url) {
        Ok(url) if url.host_str().is_some() => {
            (url.scheme().to_string(), url.host_str().unwrap_or_default().to_string())
        }
        _ => {
            let (scheme, rest) = gateway_url.split_once("://").unwrap_or(("http", gateway_url));
            let authority = rest.split('/').next().unwrap_or_default();
            let host = authority.rsplit_once(':').map_or(authority, |(host, _port)| host);
            (scheme.to_string(), host.to_string())
        }
    };

    if sub_url.starts_with('/') {
        format!("{}://{}{}", scheme, host, sub_url)
    } else {
        format!("{}://{}/{}", scheme, host, sub_url)
    }
}

/// Parse a device description fetched from `location`
pub fn parse_description(xml: &str, location: &str) -> NatResult<Candidate> {
    let root = Element::parse(xml.as_bytes())
        .map_err(|e| UpnpError::XmlParseError(e.to_string()))?;

    let device = root.get_child("device")
        .ok_or_else(|| UpnpError::MissingField("device".to_string()))?;

    let device_type = device.get_child("deviceType")
        .and_then(|t| t.get_text())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| UpnpError::MissingField("deviceType".to_string()))?;

    if !device_type.contains(IGD_DEVICE_TYPE) {
        return Err(UpnpError::NotIgdDevice(device_type).into());
    }

    for service_type in [ServiceType::WanIpConnection, ServiceType::WanPppConnection] {
        if let Some((service, version)) = find_service(device, service_type) {
            let control_url = service.get_child("controlURL")
                .and_then(|c| c.get_text())
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .ok_or_else(|| UpnpError::MissingField("controlURL".to_string()))?;

            return Ok(Candidate::new(combine_urls(location, &control_url), service_type)
                .with_version(version));
        }
    }

    Err(UpnpError::NoUsableService.into())
}

/// Depth-first search through `serviceList` and nested `deviceList` entries.
/// Returns the service node and its advertised version.
fn find_service(device: &Element, wanted: ServiceType) -> Option<(&Element, u8)> {
    if let Some(service_list) = device.get_child("serviceList") {
        for service in child_elements(service_list, "service") {
            let version = service.get_child("serviceType")
                .and_then(|t| t.get_text())
                .and_then(|t| wanted.version_in(&t));
            if let Some(version) = version {
                return Some((service, version));
            }
        }
    }

    let device_list = device.get_child("deviceList")?;
    child_elements(device_list, "device").find_map(|embedded| find_service(embedded, wanted))
}

fn child_elements<'a>(parent: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
    parent.children.iter().filter_map(move |child| match child {
        XMLNode::Element(elem) if elem.name == name => Some(elem),
        _ => None,
    })
}

/// Fetch the description at `location` and turn it into a candidate
pub async fn fetch_candidate(http: &dyn HttpTransport, location: &str) -> NatResult<Candidate> {
    let xml = http.get(location).await?;
    parse_description(&xml, location)
}
