/// mDNS service type advertised by Cygnus IoT devices
pub const CYGNUS_SERVICE_TYPE: &str = "_cygnus._tcp.local.";

/// Reserved TXT record keys mapped directly onto descriptor fields
pub const TXT_IP: &str = "ip";
pub const TXT_IMEI: &str = "imei";
pub const TXT_DEVICE_ID: &str = "device_id";
pub const TXT_MODEL: &str = "model";
pub const TXT_FIRMWARE: &str = "fw";
pub const TXT_MEMORY_USAGE: &str = "memory_usage";

/// Placeholder for metadata a device did not advertise
pub const UNKNOWN: &str = "N/A";
