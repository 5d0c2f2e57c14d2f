//! SMTP reply codes and enhanced status codes emitted by the analysis and
//! delivery paths (RFC 5321 and RFC 3463).

/// Requested action not taken: mailbox unavailable.
pub const C550_MAILBOX_UNAVAIL: u16 = 550;
/// Requested action aborted: local error in processing.
pub const C451_LOCAL_ERR: u16 = 451;
/// Requested action not taken: insufficient system storage.
pub const C452_INSUFFICIENT_STORAGE: u16 = 452;
/// Authentication credentials invalid.
pub const C535_AUTH_BAD_CREDS: u16 = 535;
/// Authentication required.
pub const C530_AUTH_REQUIRED: u16 = 530;
/// Syntax error, command unrecognized.
pub const C500_BAD_SYNTAX: u16 = 500;
/// Syntax error in parameters or arguments.
pub const C501_BAD_PARAM_SYNTAX: u16 = 501;

/// Multiple authentication checks failed (DMARC reject).
pub const SE_POL7_MULTI_AUTH_FAILS_26: &str = "5.7.26";
/// Delivery not authorized, message refused (policy reject).
pub const SE_POL7_DELIVERY_UNAUTH_1: &str = "5.7.1";
/// Authentication credentials invalid.
pub const SE_POL7_AUTH_BAD_CREDS_8: &str = "5.7.8";
/// Authentication required.
pub const SE_POL7_OTHER_0: &str = "5.7.0";
/// Bad destination mailbox address.
pub const SE_ADDR1_UNKNOWN_DEST_MAILBOX_1: &str = "5.1.1";
/// Bad destination mailbox address syntax.
pub const SE_ADDR1_BAD_DEST_SYNTAX_3: &str = "5.1.3";
/// Other or undefined mail system status (local error).
pub const SE_SYS3_OTHER_0: &str = "5.3.0";
/// Mailbox full / rate limited.
pub const SE_MAILBOX2_FULL_1: &str = "4.2.1";
