//! Field composition: single fields, value lists, constants and ordered
//! sets, built from configuration rows and bound to telegram payloads.

mod template;

pub use template::Templates;

use std::collections::BTreeMap;

use crate::datatype::{self, DataType, Value, MAX_FIELD_LEN, NULL_VALUE, REMAIN_LEN};
use crate::error::{Error, Result};
use crate::symbol::SymbolString;

/// Separator between values of one field set in textual input/output.
pub const VALUE_SEPARATOR: char = ';';
/// Separator between a value list id and its label.
const LABEL_SEPARATOR: char = '=';

/// One configuration row, keyed by the (lower-case) column names.
pub type Row = BTreeMap<String, String>;

/// The half of an exchange a field lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartType {
    /// Templates leave the part open until they are referenced.
    Any,
    MasterData,
    SlaveData,
}

/// Output selection bitmask shared by the line and JSON formatters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputFormat(pub u32);

impl OutputFormat {
    pub const NAMES: OutputFormat = OutputFormat(0x01);
    pub const UNITS: OutputFormat = OutputFormat(0x02);
    pub const COMMENTS: OutputFormat = OutputFormat(0x04);
    /// Value lists and week days render their raw number.
    pub const NUMERIC: OutputFormat = OutputFormat(0x08);
    pub const VALUE_NAME: OutputFormat = OutputFormat(0x10);
    pub const ALL_ATTRS: OutputFormat = OutputFormat(0x20);
    pub const SHORT: OutputFormat = OutputFormat(0x40);
    pub const JSON: OutputFormat = OutputFormat(0x80);
    pub const DEFINITION: OutputFormat = OutputFormat(0x100);

    pub fn contains(self, other: OutputFormat) -> bool {
        self.0 & other.0 != 0
    }

    pub fn with(self, other: OutputFormat) -> OutputFormat {
        OutputFormat(self.0 | other.0)
    }
}

/// Unit, comment and arbitrary key/value annotations of a field or message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    pub unit: String,
    pub comment: String,
    pub extra: BTreeMap<String, String>,
}

impl Attributes {
    /// Pulls the known columns out of a row; everything left is an extra
    /// attribute.
    pub fn from_row(row: &mut Row) -> Attributes {
        let unit = row.remove("unit").unwrap_or_default();
        let comment = row.remove("comment").unwrap_or_default();
        let extra = std::mem::take(row);
        Attributes { unit, comment, extra }
    }

    /// Fills empty unit/comment from another set (template derivation).
    fn merge_from(&mut self, other: &Attributes) {
        if self.unit.is_empty() {
            self.unit = other.unit.clone();
        }
        if self.comment.is_empty() {
            self.comment = other.comment.clone();
        }
        for (key, value) in &other.extra {
            self.extra.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

/// The divisor column value that turns `base` into `current`, if any.
fn declared_divisor(base: i32, current: i32) -> Option<i32> {
    if current == base {
        None
    } else if base != 0 && current % base == 0 {
        Some(current / base)
    } else if current != 0 && base % current == 0 {
        Some(-(base / current))
    } else {
        None
    }
}

/// Parses a value list `id=label;id=label` with decimal or 0x-hex ids.
pub fn parse_value_list(input: &str) -> Result<BTreeMap<u32, String>> {
    let mut values = BTreeMap::new();
    for entry in input.split(VALUE_SEPARATOR) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (id, label) = entry
            .split_once(LABEL_SEPARATOR)
            .ok_or_else(|| Error::InvalidList(entry.to_string()))?;
        let id = id.trim();
        let id = if let Some(hex) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16)
        } else {
            id.parse()
        }
        .map_err(|_| Error::InvalidList(entry.to_string()))?;
        values.insert(id, label.trim().to_string());
    }
    if values.is_empty() {
        return Err(Error::InvalidList(input.to_string()));
    }
    Ok(values)
}

/// A single data field at its position within one telegram part.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleField {
    pub name: String,
    pub part: PartType,
    pub data_type: DataType,
    /// Raw value to label map for value list fields.
    pub values: Option<BTreeMap<u32, String>>,
    /// Pre-encoded constant bytes plus the verify-on-read flag.
    pub constant: Option<(Vec<u8>, bool)>,
    pub attributes: Attributes,
}

/// A field tree: one single field or an ordered set of them.
#[derive(Debug, Clone, PartialEq)]
pub enum DataField {
    Single(SingleField),
    Set { name: String, fields: Vec<SingleField> },
}

/// Walks field positions within one part, handling bit packing: adjacent
/// bit fields share a byte until the widths reach bit 8 or a field starts
/// over at a lower bit.
#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    offset: usize,
    /// Next free bit in the previous byte, 0 when byte-aligned.
    bit_pos: u8,
}

impl Cursor {
    /// Returns the byte index for the field and advances the cursor.
    fn advance(&mut self, data_type: &DataType, available: Option<usize>) -> usize {
        let bits = data_type.bit_count();
        if bits > 0 {
            let first = match data_type {
                DataType::Number(t) => t.first_bit,
                _ => 0,
            };
            if self.bit_pos > 0 && first >= self.bit_pos && first + bits <= 8 {
                self.bit_pos = if first + bits == 8 { 0 } else { first + bits };
                return self.offset - 1;
            }
            let index = self.offset;
            self.offset += 1;
            self.bit_pos = if first + bits == 8 { 0 } else { first + bits };
            return index;
        }
        self.bit_pos = 0;
        let index = self.offset;
        let len = if data_type.is_remain() {
            available.map(|a| a.saturating_sub(index)).unwrap_or(0)
        } else {
            data_type.byte_len() as usize
        };
        self.offset += len;
        index
    }
}

impl SingleField {
    fn create(
        name: String,
        attributes: Attributes,
        data_type: DataType,
        part: PartType,
        divisor: i32,
        constant: Option<(&str, bool)>,
        values: Option<BTreeMap<u32, String>>,
    ) -> Result<SingleField> {
        let data_type = data_type.derive(divisor)?;
        let constant = match constant {
            Some((text, verify)) => {
                let mut bytes = Vec::new();
                data_type.encode(text, &mut bytes)?;
                Some((bytes, verify))
            }
            None => None,
        };
        if let Some(values) = &values {
            if !data_type.is_listable() {
                return Err(Error::invalid_arg(format!(
                    "value list on type {}",
                    data_type.name()
                )));
            }
            if values.is_empty() {
                return Err(Error::InvalidList(String::new()));
            }
        }
        Ok(SingleField {
            name,
            part,
            data_type,
            values,
            constant,
            attributes,
        })
    }

    /// Whether the field consumes a token of the textual input on write and
    /// produces output on read.
    pub fn is_visible(&self) -> bool {
        self.constant.is_none() && !self.data_type.is_ignored()
    }

    fn decode_at(&self, data: &[u8], index: usize) -> Result<Option<Value>> {
        if index > data.len() {
            return Err(Error::InvalidPos);
        }
        let slice = &data[index..];
        if let Some((bytes, verify)) = &self.constant {
            if slice.len() < bytes.len() {
                return Err(Error::InvalidPos);
            }
            if *verify && &slice[..bytes.len()] != bytes.as_slice() {
                return Err(Error::OutOfRange);
            }
            return Ok(None);
        }
        if self.data_type.is_ignored() {
            if !self.data_type.is_remain()
                && slice.len() < self.data_type.byte_len() as usize
            {
                return Err(Error::InvalidPos);
            }
            return Ok(None);
        }
        if let Some(values) = &self.values {
            let raw = self.data_type.read_raw(slice)?;
            return Ok(Some(match values.get(&raw) {
                Some(label) => Value::Str(label.clone()),
                None if self.data_type.replacement() == Some(raw) => Value::Null,
                None => Value::Int(raw as i64),
            }));
        }
        self.data_type.decode(slice).map(Some)
    }

    fn encode_value(&self, input: &str, out: &mut Vec<u8>) -> Result<()> {
        if let Some((bytes, _)) = &self.constant {
            out.extend_from_slice(bytes);
            return Ok(());
        }
        if self.data_type.is_ignored() {
            return self.data_type.encode("", out);
        }
        if let Some(values) = &self.values {
            let input = input.trim();
            if input.is_empty() || input == NULL_VALUE {
                let replacement = self.data_type.replacement().ok_or(Error::OutOfRange)?;
                return self.data_type.write_raw(replacement, out);
            }
            if let Some((&id, _)) = values.iter().find(|(_, label)| label.as_str() == input) {
                return self.data_type.write_raw(id, out);
            }
            // numeric fall-back must still name a listed value
            let parsed = if let Some(hex) =
                input.strip_prefix("0x").or_else(|| input.strip_prefix("0X"))
            {
                u32::from_str_radix(hex, 16)
            } else {
                input.parse()
            };
            return match parsed {
                Ok(id) if values.contains_key(&id) => self.data_type.write_raw(id, out),
                Ok(_) => Err(Error::InvalidList(input.to_string())),
                Err(_) => Err(Error::InvalidList(input.to_string())),
            };
        }
        self.data_type.encode(input, out)
    }

    fn raw_of_label(&self, label: &str) -> Option<u32> {
        self.values.as_ref().and_then(|values| {
            values
                .iter()
                .find(|(_, l)| l.as_str() == label)
                .map(|(&id, _)| id)
        })
    }

    fn format(&self, value: &Value, fmt: OutputFormat, index: usize) -> String {
        let with_attrs = !fmt.contains(OutputFormat::SHORT);
        let value = match value {
            Value::Str(label) if fmt.contains(OutputFormat::NUMERIC) && self.values.is_some() => {
                // reverse lookup of the raw id for numeric output
                self.raw_of_label(label)
                    .map(|id| Value::Int(id as i64))
                    .unwrap_or_else(|| value.clone())
            }
            Value::Str(label) if fmt.contains(OutputFormat::VALUE_NAME) && self.values.is_some() => {
                // raw id and label side by side
                match self.raw_of_label(label) {
                    Some(id) => Value::Str(format!("{}={}", id, label)),
                    None => value.clone(),
                }
            }
            _ => value.clone(),
        };
        let mut out = String::new();
        if fmt.contains(OutputFormat::JSON) {
            let name = if self.name.is_empty() {
                index.to_string()
            } else {
                self.name.clone()
            };
            out.push_str(&format!("\"{}\": {{\"value\": {}", name, value.to_json()));
            if with_attrs {
                if fmt.contains(OutputFormat::UNITS) && !self.attributes.unit.is_empty() {
                    out.push_str(&format!(", \"unit\": \"{}\"", self.attributes.unit));
                }
                if fmt.contains(OutputFormat::COMMENTS) && !self.attributes.comment.is_empty() {
                    out.push_str(&format!(", \"comment\": \"{}\"", self.attributes.comment));
                }
                if fmt.contains(OutputFormat::ALL_ATTRS) {
                    for (key, attr) in &self.attributes.extra {
                        out.push_str(&format!(", \"{}\": \"{}\"", key, attr));
                    }
                }
            }
            out.push('}');
            return out;
        }
        if fmt.contains(OutputFormat::NAMES) {
            out.push_str(&self.name);
            out.push('=');
        }
        out.push_str(&value.to_string());
        if with_attrs {
            if fmt.contains(OutputFormat::UNITS) && !self.attributes.unit.is_empty() {
                out.push(' ');
                out.push_str(&self.attributes.unit);
            }
            if fmt.contains(OutputFormat::COMMENTS) && !self.attributes.comment.is_empty() {
                out.push_str(&format!(" [{}]", self.attributes.comment));
            }
            if fmt.contains(OutputFormat::ALL_ATTRS) {
                for (key, attr) in &self.attributes.extra {
                    out.push_str(&format!(" {}={}", key, attr));
                }
            }
        }
        out
    }

    /// Dumps the six definition columns of this field
    /// (name, part, type, divisor/values, unit, comment).
    fn definition(&self) -> String {
        let part = match self.part {
            PartType::Any => "",
            PartType::MasterData => "m",
            PartType::SlaveData => "s",
        };
        let mut type_name = self.data_type.name().to_string();
        match &self.data_type {
            DataType::Str(t) if t.len != 1 => {
                if t.len == REMAIN_LEN {
                    type_name.push_str(":*");
                } else {
                    type_name.push_str(&format!(":{}", t.len));
                }
            }
            DataType::Number(t) if t.bits < 8 && t.bits > 1 => {
                type_name.push_str(&format!(":{}", t.bits));
            }
            DataType::Number(t) if t.flags & crate::datatype::BCD_FLAGS != 0 => {
                let default_len = if t.name == "HCD" { 4 } else { 1 };
                if t.name != "PIN" && t.byte_len() != default_len {
                    type_name.push_str(&format!(":{}", t.byte_len()));
                }
            }
            DataType::DateTime(t) if (t.name == "BDA" || t.name == "HDA") && t.len == 3 => {
                type_name.push_str(":3");
            }
            _ => {}
        }
        let divisor_or_values = if let Some(values) = &self.values {
            values
                .iter()
                .map(|(id, label)| format!("{}={}", id, label))
                .collect::<Vec<_>>()
                .join(";")
        } else if let Some((bytes, verify)) = &self.constant {
            let text = self
                .data_type
                .decode(bytes)
                .map(|value| value.to_string())
                .unwrap_or_default();
            format!("{}{}", if *verify { "==" } else { "=" }, text)
        } else {
            match (&self.data_type, datatype::get(self.data_type.name(), 0)) {
                (DataType::Number(t), Ok(DataType::Number(base))) => {
                    declared_divisor(base.divisor, t.divisor)
                        .map(|d| d.to_string())
                        .unwrap_or_default()
                }
                _ => String::new(),
            }
        };
        let quote = |text: &str| {
            if text.contains(',') {
                format!("\"{}\"", text)
            } else {
                text.to_string()
            }
        };
        format!(
            "{},{},{},{},{},{}",
            self.name,
            part,
            type_name,
            divisor_or_values,
            quote(&self.attributes.unit),
            quote(&self.attributes.comment)
        )
    }
}

impl DataField {
    /// Builds a field tree from subfield rows, resolving type tokens as
    /// basetype[:len], template name, or template:rename, in that order.
    pub fn create(
        rows: Vec<Row>,
        templates: &Templates,
        is_write: bool,
        is_template: bool,
        is_broadcast_or_master: bool,
    ) -> Result<DataField> {
        let mut fields: Vec<SingleField> = Vec::new();
        let mut first_name = String::new();
        for (field_index, mut row) in rows.into_iter().enumerate() {
            let name = row.remove("name").unwrap_or_default();
            let part_text = row.remove("part").unwrap_or_default();
            let part = if is_template {
                PartType::Any
            } else {
                match part_text.to_lowercase().as_str() {
                    "m" => PartType::MasterData,
                    "s" => PartType::SlaveData,
                    "" => {
                        if is_broadcast_or_master || is_write {
                            PartType::MasterData
                        } else {
                            PartType::SlaveData
                        }
                    }
                    other => {
                        return Err(Error::invalid_arg(format!(
                            "part {} in field {}",
                            other, field_index
                        )))
                    }
                }
            };
            if fields.is_empty() {
                first_name = name.clone();
            }
            let type_text = row.remove("type").unwrap_or_default();
            if type_text.is_empty() {
                return Err(Error::invalid_arg(format!("field type in field {}", field_index)));
            }

            let mut divisor_text = row.remove("divisor").unwrap_or_default();
            let mut values_text = row.remove("values").unwrap_or_default();
            if divisor_text.is_empty() && values_text.is_empty() {
                let combined = row.remove("divisor/values").unwrap_or_default();
                if combined.contains(LABEL_SEPARATOR) {
                    values_text = combined;
                } else {
                    divisor_text = combined;
                }
            } else {
                row.remove("divisor/values");
            }
            let divisor: i32 = if divisor_text.trim().is_empty() {
                0
            } else {
                divisor_text
                    .trim()
                    .parse()
                    .map_err(|_| Error::invalid_arg(format!("divisor {}", divisor_text)))?
            };

            let mut constant: Option<(String, bool)> = None;
            let mut values: Option<BTreeMap<u32, String>> = None;
            let values_text = values_text.trim();
            if !values_text.is_empty() {
                if let Some(rest) = values_text.strip_prefix("==") {
                    constant = Some((rest.to_string(), true));
                } else if let Some(rest) = values_text.strip_prefix('=') {
                    constant = Some((rest.to_string(), false));
                } else {
                    values = Some(parse_value_list(values_text)?);
                }
            }

            let tokens: Vec<&str> = type_text.split(VALUE_SEPARATOR).collect();
            let multiple = tokens.len() > 1;
            for (token_index, token) in tokens.iter().enumerate() {
                let token = token.trim();
                let first_type = token_index == 0;
                let last_type = token_index + 1 == tokens.len();
                let field_name = if first_type { name.clone() } else { String::new() };
                // unit and comment belong to the first type of the row only
                let attributes = {
                    let mut copy = row.clone();
                    if !first_type {
                        copy.remove("unit");
                        copy.remove("comment");
                    }
                    Attributes::from_row(&mut copy)
                };

                let (base, rename) = match token.split_once(':') {
                    Some((base, rest)) => (base, Some(rest)),
                    None => (token, None),
                };
                if let Some(template) = templates
                    .get(token)
                    .or_else(|| templates.get(base))
                {
                    if constant.is_some() {
                        return Err(Error::invalid_arg(format!(
                            "constant value on template {}",
                            token
                        )));
                    }
                    let rename = if templates.get(token).is_some() {
                        // full token matched, no rename suffix involved
                        None
                    } else {
                        rename
                    };
                    let derived_name = match rename {
                        Some(alias) => alias.to_string(),
                        None if first_type && last_type && !multiple => field_name.clone(),
                        None => String::new(),
                    };
                    template.derive(
                        &derived_name,
                        part,
                        if first_type { divisor } else { 0 },
                        if first_type { values.clone() } else { None },
                        &attributes,
                        &mut fields,
                    )?;
                    continue;
                }

                // basetype[:len]
                let length = match rename {
                    None => 0,
                    Some("*") => REMAIN_LEN,
                    Some(len_text) => {
                        let length: u8 = len_text.parse().map_err(|_| {
                            Error::invalid_arg(format!("field length {}", len_text))
                        })?;
                        if length == 0 || length > MAX_FIELD_LEN {
                            return Err(Error::invalid_arg(format!("field length {}", length)));
                        }
                        length
                    }
                };
                let data_type = datatype::get(&base.to_uppercase(), length)?;
                let field = SingleField::create(
                    field_name,
                    attributes,
                    data_type,
                    part,
                    if first_type { divisor } else { 0 },
                    if first_type {
                        constant.as_ref().map(|(text, verify)| (text.as_str(), *verify))
                    } else {
                        None
                    },
                    if first_type { values.clone() } else { None },
                )?;
                fields.push(field);
            }
        }

        // an open-ended field leaves nothing to anchor a follower to
        for part in [PartType::MasterData, PartType::SlaveData, PartType::Any] {
            let mut open_ended = false;
            for field in fields.iter().filter(|f| f.part == part) {
                if open_ended {
                    return Err(Error::invalid_arg("field after open-ended length"));
                }
                open_ended = field.data_type.is_remain();
            }
        }

        if fields.len() == 1 {
            Ok(DataField::Single(fields.into_iter().next().unwrap()))
        } else {
            Ok(DataField::Set {
                name: first_name,
                fields,
            })
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DataField::Single(field) => &field.name,
            DataField::Set { name, .. } => name,
        }
    }

    pub fn fields(&self) -> &[SingleField] {
        match self {
            DataField::Single(field) => std::slice::from_ref(field),
            DataField::Set { fields, .. } => fields,
        }
    }

    /// Clones this field tree into `out` with a new name/part/divisor/value
    /// list, as referenced from a message or another template.
    pub fn derive(
        &self,
        name: &str,
        part: PartType,
        divisor: i32,
        values: Option<BTreeMap<u32, String>>,
        attributes: &Attributes,
        out: &mut Vec<SingleField>,
    ) -> Result<()> {
        let fields = self.fields();
        if fields.len() > 1 && values.is_some() {
            return Err(Error::invalid_arg("value list on template set"));
        }
        for field in fields {
            let mut derived = field.clone();
            if !name.is_empty() && fields.len() == 1 {
                derived.name = name.to_string();
            }
            if derived.part == PartType::Any {
                derived.part = part;
            }
            if divisor != 0 && divisor != 1 {
                derived.data_type = derived.data_type.derive(divisor)?;
            }
            if let Some(values) = &values {
                if derived.values.is_some() || !derived.data_type.is_listable() {
                    return Err(Error::invalid_arg("value list on derived field"));
                }
                derived.values = Some(values.clone());
            }
            derived.attributes.merge_from(attributes);
            out.push(derived);
        }
        Ok(())
    }

    /// The byte length this tree occupies in the given part, `None` when an
    /// open-ended `*` field makes it depend on the payload.
    pub fn part_len(&self, part: PartType) -> Option<usize> {
        let mut cursor = Cursor::default();
        for field in self.fields().iter().filter(|f| f.part == part) {
            if field.data_type.is_remain() {
                return None;
            }
            cursor.advance(&field.data_type, None);
        }
        Some(cursor.offset)
    }

    /// Decodes both payload parts into the shared textual representation.
    /// `master_offset` skips the identifier bytes preceding the field data
    /// in the master payload. Returns an empty string when only invisible
    /// fields exist.
    pub fn read(
        &self,
        master: &SymbolString,
        master_offset: usize,
        slave: &SymbolString,
        fmt: OutputFormat,
        field_filter: Option<&str>,
    ) -> Result<String> {
        if fmt.contains(OutputFormat::DEFINITION) {
            let defs: Vec<String> = self.fields().iter().map(|f| f.definition()).collect();
            return Ok(defs.join(","));
        }
        // master fields render before slave fields, declaration order within
        let mut parts: Vec<String> = Vec::new();
        let mut index = 0usize;
        for part in [PartType::MasterData, PartType::SlaveData] {
            let data = match part {
                PartType::SlaveData => slave.payload(),
                _ => {
                    let payload = master.payload();
                    if master_offset > payload.len() {
                        return Err(Error::InvalidPos);
                    }
                    &payload[master_offset..]
                }
            };
            let mut cursor = Cursor::default();
            for field in self
                .fields()
                .iter()
                .filter(|f| f.part == part || (f.part == PartType::Any && part == PartType::MasterData))
            {
                let at = cursor.advance(&field.data_type, Some(data.len()));
                let value = field.decode_at(data, at)?;
                if let Some(value) = value {
                    if let Some(filter) = field_filter {
                        if !field.name.eq_ignore_ascii_case(filter) {
                            index += 1;
                            continue;
                        }
                    }
                    parts.push(field.format(&value, fmt, index));
                }
                index += 1;
            }
        }
        if fmt.contains(OutputFormat::JSON) {
            Ok(parts.join(", "))
        } else {
            Ok(parts.join(&VALUE_SEPARATOR.to_string()))
        }
    }

    /// Encodes the `;`-separated textual values of the given part into a
    /// payload buffer. Invisible fields emit their fixed bytes without
    /// consuming input.
    pub fn write(&self, part: PartType, input: &str, out: &mut Vec<u8>) -> Result<()> {
        let tokens: Vec<&str> = if input.is_empty() {
            Vec::new()
        } else {
            input.split(VALUE_SEPARATOR).collect()
        };
        let mut consumed = 0usize;
        let mut bit_pos: u8 = 0;
        for field in self
            .fields()
            .iter()
            .filter(|f| f.part == part || (f.part == PartType::Any && part == PartType::MasterData))
        {
            let token = if field.is_visible() {
                let token = tokens.get(consumed).copied().unwrap_or("");
                consumed += 1;
                token
            } else {
                ""
            };
            let bits = field.data_type.bit_count();
            if bits > 0 {
                let first = match &field.data_type {
                    DataType::Number(t) => t.first_bit,
                    _ => 0,
                };
                let mut byte = Vec::with_capacity(1);
                field.encode_value(token, &mut byte)?;
                if bit_pos > 0 && first >= bit_pos && first + bits <= 8 {
                    let last = out.last_mut().ok_or(Error::InvalidPos)?;
                    *last |= byte[0];
                } else {
                    out.push(byte[0]);
                }
                bit_pos = if first + bits == 8 { 0 } else { first + bits };
                continue;
            }
            bit_pos = 0;
            field.encode_value(token, out)?;
        }
        if consumed < tokens.len() {
            return Err(Error::invalid_arg("surplus field value"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::Part;

    fn row(entries: &[(&str, &str)]) -> Row {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn field_def(def: &str, templates: &Templates) -> DataField {
        // def: name,part,type[,divisor/values[,unit[,comment]]]
        let rows: Vec<Row> = def
            .split('#')
            .map(|sub| {
                let cols: Vec<&str> = sub.split(',').collect();
                let mut r = Row::new();
                for (key, index) in [
                    ("name", 0),
                    ("part", 1),
                    ("type", 2),
                    ("divisor/values", 3),
                    ("unit", 4),
                    ("comment", 5),
                ] {
                    if let Some(value) = cols.get(index) {
                        if !value.is_empty() {
                            r.insert(key.to_string(), value.to_string());
                        }
                    }
                }
                r
            })
            .collect();
        DataField::create(rows, templates, false, false, true).unwrap()
    }

    fn strings(master_hex: &str, slave_hex: &str) -> (SymbolString, SymbolString) {
        (
            SymbolString::parse_hex(Part::Master, master_hex, false).unwrap(),
            SymbolString::parse_hex(Part::Slave, slave_hex, false).unwrap(),
        )
    }

    #[test]
    fn single_field_read_write() {
        let templates = Templates::new();
        let field = field_def("x,,D2B,,°C,Outside", &templates);
        let (master, slave) = strings("10fe0700020112", "00");
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            "18.004"
        );
        let verbose = OutputFormat::NAMES
            .with(OutputFormat::UNITS)
            .with(OutputFormat::COMMENTS);
        assert_eq!(
            field.read(&master, 0, &slave, verbose, None).unwrap(),
            "x=18.004 °C [Outside]"
        );
        let mut out = Vec::new();
        field.write(PartType::MasterData, "18.004", &mut out).unwrap();
        assert_eq!(out, vec![0x01, 0x12]);
    }

    #[test]
    fn value_list_field() {
        let templates = Templates::new();
        let field = field_def("mode,,UCH,0=off;1=auto;2=on", &templates);
        let (master, slave) = strings("10fe07000102", "00");
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            "on"
        );
        let mut out = Vec::new();
        field.write(PartType::MasterData, "auto", &mut out).unwrap();
        assert_eq!(out, vec![0x01]);
        let mut out = Vec::new();
        assert_eq!(
            field.write(PartType::MasterData, "4", &mut out),
            Err(Error::InvalidList("4".to_string()))
        );
        // replacement decodes to the null token
        let (master, slave) = strings("10fe070001ff", "00");
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            "-"
        );
    }

    #[test]
    fn bit_packed_set() {
        let templates = Templates::new();
        let field = field_def("b0,,BI0#b1,,BI1#b2,,BI2:6", &templates);
        assert_eq!(field.part_len(PartType::MasterData), Some(1));
        let mut out = Vec::new();
        field
            .write(PartType::MasterData, "1;1;3", &mut out)
            .unwrap();
        assert_eq!(out, vec![0x0F]);
        let (master, slave) = strings("10fe0700010f", "00");
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            "1;1;3"
        );
    }

    #[test]
    fn bits_restart_new_byte() {
        let templates = Templates::new();
        let field = field_def("x,,BI0#y,,BI7#z,,BI0", &templates);
        assert_eq!(field.part_len(PartType::MasterData), Some(2));
        let mut out = Vec::new();
        field.write(PartType::MasterData, "0;1;1", &mut out).unwrap();
        assert_eq!(out, vec![0x80, 0x01]);
        let (master, slave) = strings("10fe0700028001", "00");
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            "0;1;1"
        );
    }

    #[test]
    fn constant_fields() {
        let templates = Templates::new();
        let field = field_def("x,,UCH,==48", &templates);
        let (master, slave) = strings("10fe07000130", "00");
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            ""
        );
        let (master, slave) = strings("10fe070001ab", "00");
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None),
            Err(Error::OutOfRange)
        );
        // without verification the mismatch decodes silently
        let field = field_def("x,,UCH,=48", &templates);
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            ""
        );
        let mut out = Vec::new();
        field.write(PartType::MasterData, "", &mut out).unwrap();
        assert_eq!(out, vec![0x30]);
    }

    #[test]
    fn templates_compose_and_derive() {
        let mut templates = Templates::new();
        let temp = DataField::create(
            vec![row(&[("name", "temp"), ("type", "D2B"), ("unit", "°C")])],
            &templates,
            false,
            true,
            false,
        )
        .unwrap();
        templates.add("temp", temp, false).unwrap();

        let field = field_def("x,,temp", &templates);
        let (master, slave) = strings("10fe0700020112", "00");
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            "18.004"
        );
        // derived divisor stacks onto the template type
        let field = field_def("x,,temp,10", &templates);
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            "1.8004"
        );
        // composition of a template and a base type
        let field = field_def("x,,temp;HEX:2", &templates);
        let (master, slave) = strings("10fe07000401121314", "00");
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            "18.004;13 14"
        );
        // rename alias
        let field = field_def("x,,temp:degrees;HEX:2", &templates);
        let verbose = OutputFormat::NAMES;
        assert_eq!(
            field.read(&master, 0, &slave, verbose, None).unwrap(),
            "degrees=18.004;=13 14"
        );
    }

    #[test]
    fn open_ended_must_come_last() {
        let templates = Templates::new();
        let rows: Vec<Row> = ["x,s,STR:*", "y,s,UCH"]
            .iter()
            .map(|def| {
                let cols: Vec<&str> = def.split(',').collect();
                let mut r = Row::new();
                r.insert("name".into(), cols[0].into());
                r.insert("part".into(), cols[1].into());
                r.insert("type".into(), cols[2].into());
                r
            })
            .collect();
        assert!(matches!(
            DataField::create(rows, &templates, false, false, false),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn remain_length_field() {
        let templates = Templates::new();
        let field = field_def("x,s,STR:*", &templates);
        let (master, slave) = strings("1008070000", "056162636465");
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            "abcde"
        );
        // empty remainder decodes to an empty string
        let (master, slave) = strings("1008070000", "00");
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            ""
        );
    }

    #[test]
    fn slave_and_master_parts_mix() {
        let templates = Templates::new();
        let field = field_def("x,s,UCH#y,m,UCH", &templates);
        let (master, slave) = strings("1025ffff0103", "0102");
        // master fields render first
        assert_eq!(
            field.read(&master, 0, &slave, OutputFormat::default(), None).unwrap(),
            "3;2"
        );
    }

    #[test]
    fn json_output() {
        let templates = Templates::new();
        let field = field_def("mode,,UCH,0=off;1=on,,State", &templates);
        let (master, slave) = strings("10fe07000101", "00");
        let fmt = OutputFormat::JSON.with(OutputFormat::COMMENTS);
        assert_eq!(
            field.read(&master, 0, &slave, fmt, None).unwrap(),
            "\"mode\": {\"value\": \"on\", \"comment\": \"State\"}"
        );
    }

    #[test]
    fn value_name_and_short_formats() {
        let templates = Templates::new();
        let field = field_def("mode,,UCH,0=off;1=on,bar,State", &templates);
        let (master, slave) = strings("10fe07000101", "00");
        let fmt = OutputFormat::VALUE_NAME;
        assert_eq!(field.read(&master, 0, &slave, fmt, None).unwrap(), "1=on");
        let fmt = OutputFormat::UNITS
            .with(OutputFormat::COMMENTS)
            .with(OutputFormat::SHORT);
        assert_eq!(field.read(&master, 0, &slave, fmt, None).unwrap(), "on");
    }

    #[test]
    fn field_filter_selects_one() {
        let templates = Templates::new();
        let field = field_def("a,,UCH#b,,UCH", &templates);
        let (master, slave) = strings("10fe0700020105", "00");
        assert_eq!(
            field
                .read(&master, 0, &slave, OutputFormat::default(), Some("b"))
                .unwrap(),
            "5"
        );
    }
}
