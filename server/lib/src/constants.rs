//! Constants used through the server. Attribute and class names are stored
//! and compared in their normalised (lowercase) form everywhere, so the
//! constants here are already lowercased.

use std::time::Duration;

// Operational attributes, maintained by the server.
pub const ATTR_ENTRYUUID: &str = "entryuuid";
pub const ATTR_CREATETIMESTAMP: &str = "createtimestamp";
pub const ATTR_CREATORSNAME: &str = "creatorsname";
pub const ATTR_MODIFYTIMESTAMP: &str = "modifytimestamp";
pub const ATTR_MODIFIERSNAME: &str = "modifiersname";

// User attributes.
pub const ATTR_OBJECTCLASS: &str = "objectclass";
pub const ATTR_CN: &str = "cn";
pub const ATTR_OU: &str = "ou";
pub const ATTR_DC: &str = "dc";
pub const ATTR_UID: &str = "uid";
pub const ATTR_SN: &str = "sn";
pub const ATTR_GIVENNAME: &str = "givenname";
pub const ATTR_DISPLAYNAME: &str = "displayname";
pub const ATTR_MAIL: &str = "mail";
pub const ATTR_TELEPHONENUMBER: &str = "telephonenumber";
pub const ATTR_DESCRIPTION: &str = "description";
pub const ATTR_MEMBER: &str = "member";
pub const ATTR_UNIQUEMEMBER: &str = "uniquemember";
pub const ATTR_SEEALSO: &str = "seealso";
pub const ATTR_MANAGER: &str = "manager";
pub const ATTR_OWNER: &str = "owner";
pub const ATTR_MEMBERQUERY: &str = "memberquery";
pub const ATTR_MEMBERQUERYBASE: &str = "memberquerybase";

// Object classes.
pub const CLASS_TOP: &str = "top";
pub const CLASS_DOMAIN: &str = "domain";
pub const CLASS_ORGANIZATION: &str = "organization";
pub const CLASS_ORGANIZATIONALUNIT: &str = "organizationalunit";
pub const CLASS_PERSON: &str = "person";
pub const CLASS_INETORGPERSON: &str = "inetorgperson";
pub const CLASS_GROUPOFNAMES: &str = "groupofnames";
pub const CLASS_GROUPOFURLS: &str = "groupofurls";
pub const CLASS_EXTENSIBLEOBJECT: &str = "extensibleobject";

/// The DN recorded as creators/modifiers name for engine issued operations.
pub const INTERNAL_IDENTITY_DN: &str = "cn=internal";

/// Bounded lock acquisition: how many times we retry before the operation
/// surfaces a server error.
pub const LOCK_RETRY_COUNT: usize = 3;
/// How long a single lock acquisition attempt may block.
pub const LOCK_RETRY_TIMEOUT: Duration = Duration::from_millis(250);

/// Presence indexes store all ids under this single key.
pub const IDX_PRESENCE_KEY: &str = "_";
/// Substring indexes are built over n-grams of this size.
pub const IDX_SUBSTRING_NGRAM: usize = 3;
