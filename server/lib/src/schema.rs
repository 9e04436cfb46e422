//! Schema definitions. Attribute types carry the syntax and matching
//! behaviour used to normalise and compare values; classes define what an
//! entry may and must contain. The schema is loaded at startup and read
//! through copy on write transactions, so a reload never disturbs an
//! operation in flight.

use concread::cowcell::{CowCell, CowCellReadTxn, CowCellWriteTxn};
use hashbrown::HashMap;

use crate::constants::*;
use crate::prelude::*;
use crate::value::norm_attr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaAttribute {
    pub name: AttrString,
    pub description: String,
    pub multivalue: bool,
    pub operational: bool,
    pub syntax: SyntaxType,
}

impl SchemaAttribute {
    pub fn new(name: &str, description: &str, multivalue: bool, syntax: SyntaxType) -> Self {
        SchemaAttribute {
            name: norm_attr(name),
            description: description.to_string(),
            multivalue,
            operational: false,
            syntax,
        }
    }

    pub fn new_operational(
        name: &str,
        description: &str,
        multivalue: bool,
        syntax: SyntaxType,
    ) -> Self {
        SchemaAttribute {
            name: norm_attr(name),
            description: description.to_string(),
            multivalue,
            operational: true,
            syntax,
        }
    }

    /// A synthetic type for attributes the schema does not know. Directory
    /// data predating a schema change must still be readable, so resolution
    /// falls back to this rather than failing.
    pub fn new_default(name: &str) -> Self {
        SchemaAttribute {
            name: norm_attr(name),
            description: "synthetic default attribute type".to_string(),
            multivalue: true,
            operational: false,
            syntax: SyntaxType::Utf8StringInsensitive,
        }
    }

    pub fn validate_value(&self, value: &Value) -> Result<(), SchemaError> {
        if value.syntax() == self.syntax {
            Ok(())
        } else {
            Err(SchemaError::InvalidAttributeSyntax(self.name.to_string()))
        }
    }

    pub fn validate_partialvalue(&self, pv: &PartialValue) -> Result<(), SchemaError> {
        // Partial values mirror the value variants, so the same check holds.
        let syn = match pv {
            PartialValue::Utf8(_) => SyntaxType::Utf8String,
            PartialValue::Iutf8(_) => SyntaxType::Utf8StringInsensitive,
            PartialValue::Dn(_) => SyntaxType::DistinguishedName,
            PartialValue::Bool(_) => SyntaxType::Boolean,
            PartialValue::Uint32(_) => SyntaxType::Uint32,
            PartialValue::DateTime(_) => SyntaxType::UtcTimestamp,
            PartialValue::Uuid(_) => SyntaxType::Uuid,
        };
        if syn == self.syntax {
            Ok(())
        } else {
            Err(SchemaError::InvalidAttributeSyntax(self.name.to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaClass {
    pub name: AttrString,
    pub description: String,
    pub must: Vec<AttrString>,
    pub may: Vec<AttrString>,
    /// extensibleObject semantics: any known attribute is permitted.
    pub allows_any: bool,
}

impl SchemaClass {
    pub fn new(name: &str, description: &str, must: &[&str], may: &[&str]) -> Self {
        SchemaClass {
            name: norm_attr(name),
            description: description.to_string(),
            must: must.iter().map(|a| norm_attr(a)).collect(),
            may: may.iter().map(|a| norm_attr(a)).collect(),
            allows_any: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchemaInner {
    attributes: HashMap<AttrString, SchemaAttribute>,
    classes: HashMap<AttrString, SchemaClass>,
}

pub struct Schema {
    inner: CowCell<SchemaInner>,
}

pub struct SchemaReadTransaction {
    inner: CowCellReadTxn<SchemaInner>,
}

pub struct SchemaWriteTransaction<'a> {
    inner: CowCellWriteTxn<'a, SchemaInner>,
}

pub trait SchemaTransaction {
    fn inner(&self) -> &SchemaInner;

    fn get_attributes(&self) -> &HashMap<AttrString, SchemaAttribute> {
        &self.inner().attributes
    }

    fn get_classes(&self) -> &HashMap<AttrString, SchemaClass> {
        &self.inner().classes
    }

    fn attribute_type(&self, name: &str) -> Option<&SchemaAttribute> {
        self.inner().attributes.get(&norm_attr(name))
    }

    /// Resolve an attribute type, falling back to the synthetic default for
    /// unregistered names. Never fails.
    fn attribute_type_or_default(&self, name: &str) -> SchemaAttribute {
        self.attribute_type(name)
            .cloned()
            .unwrap_or_else(|| SchemaAttribute::new_default(name))
    }

    fn class(&self, name: &str) -> Option<&SchemaClass> {
        self.inner().classes.get(&norm_attr(name))
    }

    /// The syntax values of this attribute are expected to carry. Unknown
    /// attributes resolve through the synthetic default.
    fn syntax_of(&self, name: &str) -> SyntaxType {
        self.attribute_type(name)
            .map(|a| a.syntax)
            .unwrap_or(SyntaxType::Utf8StringInsensitive)
    }

    fn is_operational(&self, name: &str) -> bool {
        self.attribute_type(name)
            .map(|a| a.operational)
            .unwrap_or(false)
    }
}

impl SchemaTransaction for SchemaReadTransaction {
    fn inner(&self) -> &SchemaInner {
        &self.inner
    }
}

impl<'a> SchemaTransaction for SchemaWriteTransaction<'a> {
    fn inner(&self) -> &SchemaInner {
        &self.inner
    }
}

impl<'a> SchemaWriteTransaction<'a> {
    pub fn upsert_attribute(&mut self, attr: SchemaAttribute) {
        self.inner.attributes.insert(attr.name.clone(), attr);
    }

    pub fn upsert_class(&mut self, class: SchemaClass) {
        self.inner.classes.insert(class.name.clone(), class);
    }

    pub fn commit(self) {
        self.inner.commit();
    }
}

impl Schema {
    /// The core schema every server instance carries.
    pub fn core() -> Self {
        let mut attributes = HashMap::new();
        let mut classes = HashMap::new();

        let attrs = [
            SchemaAttribute::new(
                ATTR_OBJECTCLASS,
                "object classes of the entry",
                true,
                SyntaxType::Utf8StringInsensitive,
            ),
            SchemaAttribute::new(ATTR_CN, "common name", true, SyntaxType::Utf8StringInsensitive),
            SchemaAttribute::new(
                ATTR_OU,
                "organizational unit name",
                true,
                SyntaxType::Utf8StringInsensitive,
            ),
            SchemaAttribute::new(
                ATTR_DC,
                "domain component",
                false,
                SyntaxType::Utf8StringInsensitive,
            ),
            SchemaAttribute::new("o", "organization name", true, SyntaxType::Utf8StringInsensitive),
            SchemaAttribute::new(ATTR_UID, "user id", true, SyntaxType::Utf8StringInsensitive),
            SchemaAttribute::new(ATTR_SN, "surname", true, SyntaxType::Utf8StringInsensitive),
            SchemaAttribute::new(
                ATTR_GIVENNAME,
                "given name",
                true,
                SyntaxType::Utf8StringInsensitive,
            ),
            SchemaAttribute::new(ATTR_DISPLAYNAME, "display name", false, SyntaxType::Utf8String),
            SchemaAttribute::new(ATTR_MAIL, "mail address", true, SyntaxType::Utf8StringInsensitive),
            SchemaAttribute::new(
                ATTR_TELEPHONENUMBER,
                "telephone number",
                true,
                SyntaxType::Utf8StringInsensitive,
            ),
            SchemaAttribute::new(ATTR_DESCRIPTION, "description", true, SyntaxType::Utf8String),
            SchemaAttribute::new(ATTR_MEMBER, "group member", true, SyntaxType::DistinguishedName),
            SchemaAttribute::new(
                ATTR_UNIQUEMEMBER,
                "unique group member",
                true,
                SyntaxType::DistinguishedName,
            ),
            SchemaAttribute::new(ATTR_SEEALSO, "related entry", true, SyntaxType::DistinguishedName),
            SchemaAttribute::new(ATTR_MANAGER, "manager", true, SyntaxType::DistinguishedName),
            SchemaAttribute::new(ATTR_OWNER, "owner", true, SyntaxType::DistinguishedName),
            SchemaAttribute::new(
                ATTR_MEMBERQUERY,
                "dynamic membership filter",
                false,
                SyntaxType::Utf8String,
            ),
            SchemaAttribute::new(
                ATTR_MEMBERQUERYBASE,
                "dynamic membership search base",
                false,
                SyntaxType::DistinguishedName,
            ),
            SchemaAttribute::new_operational(
                ATTR_ENTRYUUID,
                "entry uuid",
                false,
                SyntaxType::Uuid,
            ),
            SchemaAttribute::new_operational(
                ATTR_CREATETIMESTAMP,
                "time of entry creation",
                false,
                SyntaxType::UtcTimestamp,
            ),
            SchemaAttribute::new_operational(
                ATTR_CREATORSNAME,
                "identity that created the entry",
                false,
                SyntaxType::DistinguishedName,
            ),
            SchemaAttribute::new_operational(
                ATTR_MODIFYTIMESTAMP,
                "time of last modification",
                false,
                SyntaxType::UtcTimestamp,
            ),
            SchemaAttribute::new_operational(
                ATTR_MODIFIERSNAME,
                "identity that last modified the entry",
                false,
                SyntaxType::DistinguishedName,
            ),
        ];
        for a in attrs {
            attributes.insert(a.name.clone(), a);
        }

        let clss = [
            SchemaClass::new(CLASS_TOP, "top of the class hierarchy", &[], &[ATTR_DESCRIPTION, ATTR_SEEALSO]),
            SchemaClass::new(CLASS_DOMAIN, "domain component object", &[ATTR_DC], &[ATTR_DESCRIPTION, ATTR_SEEALSO]),
            SchemaClass::new(CLASS_ORGANIZATION, "organization", &["o"], &[ATTR_DESCRIPTION, ATTR_SEEALSO]),
            SchemaClass::new(
                CLASS_ORGANIZATIONALUNIT,
                "organizational unit",
                &[ATTR_OU],
                &[ATTR_DESCRIPTION, ATTR_SEEALSO, ATTR_TELEPHONENUMBER],
            ),
            SchemaClass::new(
                CLASS_PERSON,
                "person",
                &[ATTR_CN, ATTR_SN],
                &[ATTR_DESCRIPTION, ATTR_SEEALSO, ATTR_TELEPHONENUMBER],
            ),
            SchemaClass::new(
                CLASS_INETORGPERSON,
                "internet person",
                &[ATTR_CN, ATTR_SN],
                &[
                    ATTR_DESCRIPTION,
                    ATTR_SEEALSO,
                    ATTR_TELEPHONENUMBER,
                    ATTR_UID,
                    ATTR_MAIL,
                    ATTR_GIVENNAME,
                    ATTR_DISPLAYNAME,
                    ATTR_MANAGER,
                    ATTR_OU,
                ],
            ),
            SchemaClass::new(
                CLASS_GROUPOFNAMES,
                "static group",
                &[ATTR_CN],
                &[
                    ATTR_MEMBER,
                    ATTR_UNIQUEMEMBER,
                    ATTR_DESCRIPTION,
                    ATTR_SEEALSO,
                    ATTR_OWNER,
                ],
            ),
            SchemaClass::new(
                CLASS_GROUPOFURLS,
                "dynamic group",
                &[ATTR_CN, ATTR_MEMBERQUERY, ATTR_MEMBERQUERYBASE],
                &[ATTR_DESCRIPTION, ATTR_SEEALSO, ATTR_OWNER],
            ),
        ];
        for c in clss {
            classes.insert(c.name.clone(), c);
        }

        let mut extensible = SchemaClass::new(
            CLASS_EXTENSIBLEOBJECT,
            "permits any attribute",
            &[],
            &[],
        );
        extensible.allows_any = true;
        classes.insert(extensible.name.clone(), extensible);

        Schema {
            inner: CowCell::new(SchemaInner {
                attributes,
                classes,
            }),
        }
    }

    pub fn read(&self) -> SchemaReadTransaction {
        SchemaReadTransaction {
            inner: self.inner.read(),
        }
    }

    pub fn write(&self) -> SchemaWriteTransaction<'_> {
        SchemaWriteTransaction {
            inner: self.inner.write(),
        }
    }
}
