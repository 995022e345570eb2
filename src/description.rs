//! Parsing of a bridge's `description.xml`.

use serde::Deserialize;

use crate::errors::Error;

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Deserialize)]
struct Root {
    device: BridgeDescription,
}

/// The parts of the UPnP device description a bridge is identified by.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeDescription {
    pub friendly_name: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    pub model_name: String,
    #[serde(default)]
    pub model_number: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(rename = "UDN", default)]
    pub udn: Option<String>,
}

impl BridgeDescription {
    /// Parse the XML document served at `/description.xml`.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let root: Root = quick_xml::de::from_str(xml)
            .map_err(|e| Error::Xml(format!("failed to parse description.xml: {e}")))?;
        Ok(root.device)
    }

    /// Whether the device describes itself as a Hue bridge.
    pub fn is_hue_bridge(&self) -> bool {
        self.model_name.contains("Philips hue")
    }

    /// Lower-cased serial number, if the description carries one.
    pub fn serial(&self) -> Option<String> {
        self.serial_number
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_ascii_lowercase)
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <URLBase>http://192.168.1.20:80/</URLBase>
  <device>
    <deviceType>urn:schemas-upnp-org:device:Basic:1</deviceType>
    <friendlyName>Philips hue (192.168.1.20)</friendlyName>
    <manufacturer>Royal Philips Electronics</manufacturer>
    <modelName>Philips hue bridge 2012</modelName>
    <modelNumber>929000226503</modelNumber>
    <serialNumber>00178810AB2C</serialNumber>
    <UDN>uuid:2f402f80-da50-11e1-9b23-00178810ab2c</UDN>
  </device>
</root>"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_description() {
        let desc = BridgeDescription::from_xml(SAMPLE_XML).unwrap();
        assert_eq!(desc.friendly_name, "Philips hue (192.168.1.20)");
        assert!(desc.is_hue_bridge());
        assert_eq!(desc.serial().as_deref(), Some("00178810ab2c"));
    }

    #[test]
    fn test_other_device_is_not_a_bridge() {
        let xml = SAMPLE_XML.replace("Philips hue bridge 2012", "Media Renderer");
        let desc = BridgeDescription::from_xml(&xml).unwrap();
        assert!(!desc.is_hue_bridge());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(matches!(BridgeDescription::from_xml("not xml"), Err(Error::Xml(_))));
    }
}
