//! Libvirt domain descriptor rendering.
//!
//! Descriptors are rendered from a template with `{placeholder}` fields.
//! The built-in template lives in `templates/domain.xml`; operators may
//! supply their own, which is validated once when it is loaded so that
//! rendering itself cannot fail at provisioning time.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{HypervisorError, Result};
use crate::types::RamUnit;

const BUILTIN_TEMPLATE: &str = include_str!("../templates/domain.xml");

/// Placeholders every template must contain.
const REQUIRED_PLACEHOLDERS: &[&str] = &["{name}", "{memory_kib}", "{vcpu}", "{mac}", "{disk_path}"];

/// Locally administered prefix used by QEMU/KVM guests.
pub const MAC_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

// =============================================================================
// MAC ADDRESS
// =============================================================================

/// Guest NIC MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Generate `52:54:00:xx:xx:xx` with three random octets.
    ///
    /// Collisions with existing domains are not checked.
    pub fn generate() -> Self {
        let tail: [u8; 3] = rand::random();
        Self([MAC_PREFIX[0], MAC_PREFIX[1], MAC_PREFIX[2], tail[0], tail[1], tail[2]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

// =============================================================================
// TEMPLATE
// =============================================================================

/// A validated domain descriptor template.
#[derive(Debug, Clone)]
pub struct DomainTemplate {
    source: String,
}

impl DomainTemplate {
    /// The template shipped with the crate.
    pub fn builtin() -> Self {
        Self { source: BUILTIN_TEMPLATE.to_string() }
    }

    /// Load and validate an operator-supplied template file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| HypervisorError::InvalidConfig(
                format!("Failed to read domain template {}: {}", path.display(), e)
            ))?;
        Self::parse(source)
    }

    /// Validate a template: all placeholders present and a sample rendering
    /// is well-formed XML.
    pub fn parse(source: impl Into<String>) -> Result<Self> {
        let template = Self { source: source.into() };

        let missing: Vec<&str> = REQUIRED_PLACEHOLDERS.iter()
            .copied()
            .filter(|p| !template.source.contains(p))
            .collect();
        if !missing.is_empty() {
            return Err(HypervisorError::InvalidConfig(
                format!("Domain template is missing placeholders: {}", missing.join(", "))
            ));
        }

        let sample = DomainXmlBuilder::new(&template)
            .name("template-check")
            .vcpu(1)
            .memory(1, RamUnit::GiB)
            .mac(MacAddress([0x52, 0x54, 0x00, 0, 0, 1]))
            .disk_path("/var/lib/libvirt/images/template-check")
            .build();
        check_well_formed(&sample)?;

        Ok(template)
    }
}

impl Default for DomainTemplate {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Check that `xml` parses and has a single balanced root element.
pub fn check_well_formed(xml: &str) -> Result<()> {
    let mut reader = Reader::from_str(xml);
    let mut depth: usize = 0;
    let mut roots = 0;

    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => {
                if depth == 0 {
                    roots += 1;
                }
                depth += 1;
            }
            Ok(Event::Empty(_)) if depth == 0 => roots += 1,
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(HypervisorError::InvalidDescriptor(format!(
                    "Malformed XML at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    if depth != 0 || roots != 1 {
        return Err(HypervisorError::InvalidDescriptor(
            "Descriptor must contain exactly one balanced root element".to_string()
        ));
    }
    Ok(())
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    template: &'a DomainTemplate,
    name: String,
    vcpu: u32,
    memory_kib: u64,
    mac: MacAddress,
    disk_path: PathBuf,
    network: String,
}

impl<'a> DomainXmlBuilder<'a> {
    /// Create a new builder over a validated template.
    pub fn new(template: &'a DomainTemplate) -> Self {
        Self {
            template,
            name: String::new(),
            vcpu: 1,
            memory_kib: RamUnit::GiB.kib_factor(),
            mac: MacAddress::generate(),
            disk_path: PathBuf::new(),
            network: "default".to_string(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn vcpu(mut self, vcpu: u32) -> Self {
        self.vcpu = vcpu;
        self
    }

    /// Set memory in the given unit; normalized to KiB (saturating).
    pub fn memory(mut self, value: u64, unit: RamUnit) -> Self {
        self.memory_kib = value.saturating_mul(unit.kib_factor());
        self
    }

    pub fn mac(mut self, mac: MacAddress) -> Self {
        self.mac = mac;
        self
    }

    pub fn disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = path.into();
        self
    }

    /// Libvirt network the NIC attaches to.
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Render the domain XML string.
    ///
    /// The template is scanned once; substituted values are never rescanned,
    /// so a value containing `{placeholder}` text is emitted verbatim.
    pub fn build(&self) -> String {
        let source = self.template.source.as_str();
        let mut out = String::with_capacity(source.len() + 256);
        let mut rest = source;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let value = tail.find('}').and_then(|end| {
                self.placeholder(&tail[1..end]).map(|value| (value, end))
            });
            match value {
                Some((value, end)) => {
                    out.push_str(&value);
                    rest = &tail[end + 1..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn placeholder(&self, key: &str) -> Option<String> {
        let value = match key {
            "name" => escape(self.name.as_str()).into_owned(),
            "memory_kib" => self.memory_kib.to_string(),
            "vcpu" => self.vcpu.to_string(),
            "mac" => self.mac.to_string(),
            "disk_path" => {
                let path = self.disk_path.to_string_lossy();
                escape(&*path).into_owned()
            }
            "network" => escape(self.network.as_str()).into_owned(),
            _ => return None,
        };
        Some(value)
    }
}

// =============================================================================
// PARSING
// =============================================================================

/// Fields read back from a domain descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSummary {
    pub name: String,
    pub memory_kib: u64,
    pub vcpu: u32,
    pub mac: Option<String>,
}

/// Extract name, memory, vCPUs and the first MAC from a descriptor.
pub fn summarize_descriptor(xml: &str) -> Result<DescriptorSummary> {
    check_well_formed(xml)?;

    let invalid = |msg: String| HypervisorError::InvalidDescriptor(msg);
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut memory_unit = RamUnit::KiB;

    let mut name = None;
    let mut memory = None;
    let mut vcpu = None;
    let mut mac = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.name().as_ref() == b"memory" && stack.len() == 1 {
                    if let Ok(Some(attr)) = e.try_get_attribute("unit") {
                        let unit = attr.unescape_value()
                            .map_err(|e| invalid(e.to_string()))?;
                        memory_unit = match unit.as_ref() {
                            "b" | "bytes" => return Err(invalid("memory unit bytes not supported".into())),
                            "k" | "KiB" => RamUnit::KiB,
                            "M" | "MiB" => RamUnit::MiB,
                            "G" | "GiB" => RamUnit::GiB,
                            other => return Err(invalid(format!("unknown memory unit {}", other))),
                        };
                    }
                }
                stack.push(e.name().as_ref().to_vec());
            }
            Ok(Event::Empty(e)) => {
                let in_interface = stack.last().map(|s| s.as_slice()) == Some(b"interface".as_slice());
                if e.name().as_ref() == b"mac" && in_interface && mac.is_none() {
                    if let Ok(Some(attr)) = e.try_get_attribute("address") {
                        mac = Some(attr.unescape_value()
                            .map_err(|e| invalid(e.to_string()))?
                            .into_owned());
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|e| invalid(e.to_string()))?;
                let text = text.trim();
                if stack.len() == 2 {
                    match stack[1].as_slice() {
                        b"name" => name = Some(text.to_string()),
                        b"memory" => memory = Some(text.parse::<u64>()
                            .map_err(|_| invalid(format!("invalid memory value {}", text)))?),
                        b"vcpu" => vcpu = Some(text.parse::<u32>()
                            .map_err(|_| invalid(format!("invalid vcpu value {}", text)))?),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(invalid(e.to_string())),
        }
    }

    let name = name.filter(|n| !n.is_empty())
        .ok_or_else(|| invalid("descriptor has no <name>".to_string()))?;
    let memory = memory.ok_or_else(|| invalid("descriptor has no <memory>".to_string()))?;
    let memory_kib = memory_unit.to_kib(memory)
        .ok_or_else(|| invalid("memory overflows".to_string()))?;

    Ok(DescriptorSummary {
        name,
        memory_kib,
        vcpu: vcpu.unwrap_or(1),
        mac,
    })
}
