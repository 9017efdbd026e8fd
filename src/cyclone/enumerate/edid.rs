// Monitor identification from a connector's EDID blob
//
// Austin Shafer - 2024
use edid_rs::MonitorDescriptor;

use std::io::Cursor;

/// Who made the monitor and what it calls itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorInfo {
    /// Three letter PNP id, e.g. "DEL"
    pub manufacturer: String,
    pub product: String,
    /// From the monitor name descriptor, not every display has one
    pub model: Option<String>,
}

impl MonitorInfo {
    pub fn parse(blob: &[u8]) -> Option<Self> {
        let edid = edid_rs::parse(&mut Cursor::new(blob.to_vec())).ok()?;

        let id = edid.product.manufacturer_id;
        let model = edid
            .descriptors
            .0
            .iter()
            .find_map(|desc| match desc {
                MonitorDescriptor::MonitorName(name) => Some(name.trim().to_string()),
                _ => None,
            })
            .filter(|name| !name.is_empty());

        Some(Self {
            manufacturer: [id.0, id.1, id.2].iter().collect(),
            product: format!("{}", edid.product.product_code),
            model: model,
        })
    }

    /// The model name, or the manufacturer and product code
    pub fn display_name(&self) -> String {
        match self.model.as_ref() {
            Some(model) => model.clone(),
            None => format!("{} {}", self.manufacturer, self.product),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; 8] = [0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];
    const TAG_MONITOR_NAME: u8 = 0xfc;
    const TAG_DUMMY: u8 = 0x10;

    fn descriptor(blob: &mut [u8], offset: usize, tag: u8, text: &str) {
        let desc = &mut blob[offset..offset + 18];
        desc[3] = tag;
        let mut body = [b' '; 13];
        body[..text.len()].copy_from_slice(text.as_bytes());
        if text.len() < 13 {
            body[text.len()] = b'\n';
        }
        desc[5..].copy_from_slice(&body);
    }

    /// A 1.4 EDID from "DEL" with one detailed timing and an optional name
    fn edid(name: Option<&str>) -> Vec<u8> {
        let mut blob = vec![0u8; 128];
        blob[..8].copy_from_slice(&HEADER);
        blob[8] = 0x10;
        blob[9] = 0xac;
        blob[10] = 0x9e;
        blob[11] = 0xa0;
        blob[18] = 1;
        blob[19] = 4;
        // unused standard timings
        for b in blob[38..54].iter_mut() {
            *b = 0x01;
        }

        // 1920x1080
        blob[54] = 0x02;
        blob[55] = 0x3a;
        blob[56] = 0x80;
        blob[58] = 0x70;
        blob[59] = 0x38;
        blob[61] = 0x40;

        match name {
            Some(name) => descriptor(&mut blob, 72, TAG_MONITOR_NAME, name),
            None => descriptor(&mut blob, 72, TAG_DUMMY, ""),
        }
        descriptor(&mut blob, 90, TAG_DUMMY, "");
        descriptor(&mut blob, 108, TAG_DUMMY, "");

        let sum = blob[..127].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        blob[127] = 0u8.wrapping_sub(sum);
        blob
    }

    #[test]
    fn finds_monitor_name() {
        let info = MonitorInfo::parse(&edid(Some("DELL U2720Q"))).unwrap();
        assert_eq!(info.manufacturer, "DEL");
        assert_eq!(info.model.as_deref(), Some("DELL U2720Q"));
        assert_eq!(info.display_name(), "DELL U2720Q");
    }

    #[test]
    fn nameless_monitor_uses_manufacturer() {
        let info = MonitorInfo::parse(&edid(None)).unwrap();
        assert!(info.model.is_none());
        assert!(info.display_name().starts_with("DEL "));
    }

    #[test]
    fn truncated_blob() {
        assert!(MonitorInfo::parse(&[0u8; 16]).is_none());
        assert!(MonitorInfo::parse(&[]).is_none());
    }
}
