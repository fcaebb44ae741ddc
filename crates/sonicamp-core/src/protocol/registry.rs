//! Protocol registry
//!
//! A declarative table of every command the core knows, tagged with the
//! device types, protocol versions and build types it applies to. Building
//! the registry for one `(device type, version, build)` tuple yields the
//! [`CommandLookUpTable`] a device session is allowed to use.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use super::answer::{AnswerDef, Field};
use super::catalog;
use super::commands::{request_alias, CommandCode, CommandDef};

/// Protocol or firmware version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Patch version
    pub patch: u16,
}

impl Version {
    /// `major.minor.patch`
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches(['v', 'V']);
        let parts: Vec<&str> = trimmed.split('.').collect();
        let [major, minor, patch] = parts.as_slice() else {
            return Err(format!("invalid version '{s}'"));
        };
        let number = |p: &str| p.parse::<u16>().map_err(|_| format!("invalid version '{s}'"));
        Ok(Self::new(number(major)?, number(minor)?, number(patch)?))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Protocol versions tried when a device cannot report its own
pub const LEGACY_VERSIONS: [Version; 3] = [
    Version::new(0, 3, 0),
    Version::new(0, 4, 0),
    Version::new(0, 5, 0),
];

/// First version speaking the framed protocol
pub const FRAMED_VERSION: Version = Version::new(1, 0, 0);

/// Sonicamp product line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Type not reported yet
    #[default]
    Unknown,
    /// sonicatch
    Catch,
    /// sonicwipe
    Wipe,
    /// sonicdescale
    Descale,
}

impl DeviceType {
    /// Every device type, in registry order
    pub const ALL: [DeviceType; 4] = [
        DeviceType::Unknown,
        DeviceType::Catch,
        DeviceType::Descale,
        DeviceType::Wipe,
    ];
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.strip_prefix("sonic").unwrap_or(&lower) {
            "catch" => Ok(DeviceType::Catch),
            "wipe" => Ok(DeviceType::Wipe),
            "descale" => Ok(DeviceType::Descale),
            "unknown" => Ok(DeviceType::Unknown),
            _ => Err(format!("unknown device type '{s}'")),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Unknown => write!(f, "unknown"),
            DeviceType::Catch => write!(f, "catch"),
            DeviceType::Wipe => write!(f, "wipe"),
            DeviceType::Descale => write!(f, "descale"),
        }
    }
}

/// Inclusive version range, open at either end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionRange {
    /// Lowest version included
    pub min: Option<Version>,
    /// Highest version included
    pub max: Option<Version>,
}

impl VersionRange {
    /// Every version
    pub const fn any() -> Self {
        Self {
            min: None,
            max: None,
        }
    }

    /// `min` and everything after it
    pub const fn from(min: Version) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    /// `min..=max`
    pub const fn between(min: Version, max: Version) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    /// Every version before the framed protocol
    pub const fn legacy() -> Self {
        Self {
            min: None,
            max: Some(Version::new(0, 99, 99)),
        }
    }

    /// Whether `version` lies inside the range
    pub fn contains(&self, version: &Version) -> bool {
        self.min.map_or(true, |min| *version >= min) && self.max.map_or(true, |max| *version <= max)
    }
}

/// Device types an entry applies to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceFilter {
    /// Every device type
    #[default]
    Any,
    /// Only the listed types
    Only(Vec<DeviceType>),
}

impl DeviceFilter {
    /// Filter accepting only `types`
    pub fn only(types: &[DeviceType]) -> Self {
        DeviceFilter::Only(types.to_vec())
    }

    /// Whether an entry with this filter applies to `device_type`
    pub fn accepts(&self, device_type: DeviceType) -> bool {
        match self {
            DeviceFilter::Any => true,
            DeviceFilter::Only(types) => types.contains(&device_type),
        }
    }
}

/// Firmware builds an entry applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildType {
    /// Release and debug builds
    #[default]
    Any,
    /// Release builds only
    Release,
    /// Debug builds only
    Debug,
}

impl BuildType {
    /// Whether a build with the given release flag is accepted
    pub fn accepts(&self, is_release: bool) -> bool {
        match self {
            BuildType::Any => true,
            BuildType::Release => is_release,
            BuildType::Debug => !is_release,
        }
    }
}

/// How to send a command and how to read its answer
#[derive(Debug, Clone)]
pub struct CommandLookUp {
    /// Request side
    pub command_def: CommandDef,
    /// Answer side
    pub answer_def: AnswerDef,
}

/// One row of the registry
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Command and answer definition
    pub lookup: CommandLookUp,
    /// Device types the entry applies to
    pub devices: DeviceFilter,
    /// Protocol versions the entry applies to
    pub versions: VersionRange,
    /// Build kinds the entry applies to
    pub build: BuildType,
}

impl RegistryEntry {
    /// Entry for every device, version and build
    pub fn new(command_def: CommandDef, answer_def: AnswerDef) -> Self {
        Self {
            lookup: CommandLookUp {
                command_def,
                answer_def,
            },
            devices: DeviceFilter::Any,
            versions: VersionRange::any(),
            build: BuildType::Any,
        }
    }

    /// Restrict the entry to `types`
    pub fn devices(mut self, types: &[DeviceType]) -> Self {
        self.devices = DeviceFilter::only(types);
        self
    }

    /// Restrict the entry to `versions`
    pub fn versions(mut self, versions: VersionRange) -> Self {
        self.versions = versions;
        self
    }

    /// Restrict the entry to `build`
    pub fn build(mut self, build: BuildType) -> Self {
        self.build = build;
        self
    }

    fn applies_to(&self, device_type: DeviceType, version: &Version, is_release: bool) -> bool {
        self.devices.accepts(device_type)
            && self.versions.contains(version)
            && self.build.accepts(is_release)
    }
}

/// The commands available for one device, keyed by code
#[derive(Debug, Clone)]
pub struct CommandLookUpTable {
    device_type: DeviceType,
    version: Version,
    is_release: bool,
    lookups: BTreeMap<CommandCode, CommandLookUp>,
}

impl CommandLookUpTable {
    /// Device type the table was built for
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Protocol version the table was built for
    pub fn version(&self) -> Version {
        self.version
    }

    /// Whether the table was built for release firmware
    pub fn is_release(&self) -> bool {
        self.is_release
    }

    /// Lookup for `code`, if the device supports it
    pub fn get(&self, code: CommandCode) -> Option<&CommandLookUp> {
        self.lookups.get(&code)
    }

    /// Whether `code` is supported
    pub fn has(&self, code: CommandCode) -> bool {
        self.lookups.contains_key(&code)
    }

    /// Find the command a raw request string addresses
    pub fn find_by_request(&self, request: &str) -> Option<&CommandLookUp> {
        let alias = request_alias(request);
        self.lookups
            .values()
            .find(|lookup| lookup.command_def.matches_alias(alias))
    }

    /// Supported command codes
    pub fn codes(&self) -> impl Iterator<Item = CommandCode> + '_ {
        self.lookups.keys().copied()
    }

    /// Supported commands with their lookups
    pub fn lookups(&self) -> impl Iterator<Item = (&CommandCode, &CommandLookUp)> {
        self.lookups.iter()
    }

    /// Number of supported commands
    pub fn len(&self) -> usize {
        self.lookups.len()
    }

    /// Whether no command is supported
    pub fn is_empty(&self) -> bool {
        self.lookups.is_empty()
    }

    /// Status fields some command of this table can populate
    pub fn status_fields(&self) -> BTreeSet<Field> {
        self.lookups
            .values()
            .flat_map(|lookup| lookup.answer_def.fields())
            .filter(Field::is_status)
            .collect()
    }

    /// Whether a status poll of this table reports the running procedure
    pub fn can_report_procedure(&self) -> bool {
        [CommandCode::GetStatus, CommandCode::GetUpdate]
            .iter()
            .filter_map(|code| self.get(*code))
            .any(|lookup| lookup.answer_def.fields().contains(&Field::Procedure))
    }
}

/// Every command the core can speak, across all versions
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    entries: Vec<RegistryEntry>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRegistry {
    /// Registry of the known sonicamp protocols
    pub fn new() -> Self {
        Self::from_entries(catalog::entries())
    }

    /// Registry with custom entries; later entries win over earlier ones
    pub fn from_entries(entries: Vec<RegistryEntry>) -> Self {
        Self { entries }
    }

    /// Every entry, in resolution order
    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    /// The lookup table for one device.
    ///
    /// When several entries apply to the same code, the later one wins.
    pub fn build(
        &self,
        device_type: DeviceType,
        version: Version,
        is_release: bool,
    ) -> CommandLookUpTable {
        let lookups = self
            .entries
            .iter()
            .filter(|entry| entry.applies_to(device_type, &version, is_release))
            .map(|entry| (entry.lookup.command_def.code, entry.lookup.clone()))
            .collect();
        CommandLookUpTable {
            device_type,
            version,
            is_release,
            lookups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        assert_eq!("1.0.0".parse::<Version>().unwrap(), FRAMED_VERSION);
        assert_eq!("v0.4.0".parse::<Version>().unwrap(), Version::new(0, 4, 0));
        assert!("1.0".parse::<Version>().is_err());
        assert!(Version::new(0, 5, 0) < Version::new(1, 0, 0));
        assert_eq!(Version::new(0, 3, 0).to_string(), "0.3.0");
    }

    #[test]
    fn test_device_type_parsing() {
        assert_eq!("soniccatch".parse::<DeviceType>().unwrap(), DeviceType::Catch);
        assert_eq!("Descale".parse::<DeviceType>().unwrap(), DeviceType::Descale);
        assert!("toaster".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_version_ranges() {
        assert!(VersionRange::legacy().contains(&Version::new(0, 5, 0)));
        assert!(!VersionRange::legacy().contains(&FRAMED_VERSION));
        assert!(VersionRange::from(FRAMED_VERSION).contains(&Version::new(1, 2, 0)));
        assert!(VersionRange::between(Version::new(0, 4, 0), Version::new(0, 4, 99))
            .contains(&Version::new(0, 4, 3)));
    }

    #[test]
    fn test_tables_depend_on_version_and_build() {
        let registry = ProtocolRegistry::new();
        let legacy = registry.build(DeviceType::Catch, Version::new(0, 3, 0), true);
        assert!(legacy.has(CommandCode::SetFrequency));
        assert!(!legacy.has(CommandCode::GetSens));
        assert!(!legacy.has(CommandCode::Ramp));

        let release = registry.build(DeviceType::Catch, FRAMED_VERSION, true);
        assert!(release.has(CommandCode::Ramp));
        assert!(release.has(CommandCode::GetSens));
        assert!(!release.has(CommandCode::GetPzt));
        assert!(!release.has(CommandCode::Wipe));
        assert!(release.can_report_procedure());

        let debug = registry.build(DeviceType::Catch, FRAMED_VERSION, false);
        assert!(debug.has(CommandCode::GetPzt));

        let wipe = registry.build(DeviceType::Wipe, FRAMED_VERSION, true);
        assert!(wipe.has(CommandCode::Wipe));
        assert!(!wipe.has(CommandCode::Scan));
    }

    #[test]
    fn test_find_by_request() {
        let table = ProtocolRegistry::new().build(DeviceType::Catch, FRAMED_VERSION, true);
        assert_eq!(
            table.find_by_request("!freq=1000").map(|l| l.command_def.code),
            Some(CommandCode::SetFrequency)
        );
        assert_eq!(
            table.find_by_request("!atf2=1000").map(|l| l.command_def.code),
            Some(CommandCode::SetAtf)
        );
        assert!(table.find_by_request("!bogus").is_none());
    }

    #[test]
    fn test_status_fields_follow_table() {
        let registry = ProtocolRegistry::new();
        let legacy = registry.build(DeviceType::Catch, Version::new(0, 3, 0), true);
        assert!(legacy.status_fields().contains(&Field::Frequency));
        assert!(!legacy.status_fields().contains(&Field::Procedure));
        assert!(!legacy.can_report_procedure());

        let v1 = registry.build(DeviceType::Catch, FRAMED_VERSION, true);
        assert!(v1.status_fields().contains(&Field::Procedure));
        assert!(v1.status_fields().contains(&Field::Atf(4)));
    }
}
