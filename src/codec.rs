use crate::error::MapmergeError;
use crate::lot::{Format, Lot, Wafer, Wafermap};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

const LOT_XMLNS: &str = "http://cmdb.elex.be/products/electronic-wafermapping/schemas/lot";
const XSI_XMLNS: &str = "http://www.w3.org/2001/XMLSchema-instance";
const SCHEMA_LOCATION: &str = "http://cmdb.elex.be/products/electronic-wafermapping/schemas/lot http://cmdb.elex.be/products/electronic-wafermapping/schemas/lot.xsd";

/// Parse a wire lot document into a [`Lot`].
///
/// The element grammar is context sensitive: `parameter` is only recognized
/// inside `configuration-parameters` or `wafer-properties`, `format` only
/// inside a `wafermap`, and so on. Each context gets its own parse function
/// over the event stream, so malformed nesting fails instead of being
/// absorbed into the wrong container.
///
/// A `format` element with `encoding="base64"` carries an inline payload;
/// without the attribute its text is an opaque datastore reference.
pub fn decode(bytes: &[u8]) -> Result<Lot, MapmergeError> {
    let mut reader = Reader::from_reader(bytes);
    {
        let config = reader.config_mut();
        config.trim_text_start = true;
        config.trim_text_end = true;
    }
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"lot" => {
                let attrs = attr_map(&e)?;
                return parse_lot(&mut reader, attrs);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"lot" => {
                return Ok(lot_from_attrs(&attr_map(&e)?));
            }
            Event::Decl(_) | Event::Comment(_) | Event::DocType(_) | Event::PI(_) => {}
            Event::Text(_) => {}
            Event::Eof => {
                return Err(MapmergeError::Decode(
                    "document ended before a lot element".to_string(),
                ));
            }
            other => {
                return Err(MapmergeError::Decode(format!(
                    "expected a lot element, got {:?}",
                    other
                )));
            }
        }
        buf.clear();
    }
}

/// Render a [`Lot`] back to the wire schema. Wafers keep document order;
/// config keys and format tags are written in insertion order, so encoding
/// the same lot twice produces identical bytes.
pub fn encode(lot: &Lot) -> Result<Vec<u8>, MapmergeError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("lot");
    root.push_attribute(("xmlns", LOT_XMLNS));
    root.push_attribute(("xmlns:xsi", XSI_XMLNS));
    root.push_attribute(("xsi:schemaLocation", SCHEMA_LOCATION));
    root.push_attribute(("name", lot.name.as_str()));
    root.push_attribute(("item", lot.item.as_str()));
    root.push_attribute(("wafersInLot", lot.wafers_in_lot.as_str()));
    root.push_attribute(("organization", lot.organization.as_str()));
    root.push_attribute(("probelocation", lot.probe_location.as_str()));
    root.push_attribute(("subcontractor", lot.subcontractor.as_str()));
    writer.write_event(Event::Start(root))?;

    write_parameters(&mut writer, "configuration-parameters", &lot.config)?;

    for wafer in &lot.wafers {
        let mut elem = BytesStart::new("wafer");
        elem.push_attribute(("number", wafer.number.as_str()));
        elem.push_attribute(("passdies", wafer.pass_dies.as_str()));
        writer.write_event(Event::Start(elem))?;

        write_parameters(&mut writer, "wafer-properties", &wafer.config)?;

        writer.write_event(Event::Start(BytesStart::new("wafermaps")))?;
        for wafermap in &wafer.wafermaps {
            let mut elem = BytesStart::new("wafermap");
            elem.push_attribute(("name", wafermap.name.as_str()));
            writer.write_event(Event::Start(elem))?;
            writer.write_event(Event::Start(BytesStart::new("formats")))?;
            for (tag, format) in wafermap.formats() {
                let mut elem = BytesStart::new("format");
                elem.push_attribute(("name", tag));
                let text = match format {
                    Format::Inline(payload) => {
                        elem.push_attribute(("encoding", "base64"));
                        BASE64.encode(payload)
                    }
                    Format::Referenced(reference) => reference.clone(),
                };
                writer.write_event(Event::Start(elem))?;
                writer.write_event(Event::Text(BytesText::new(&text)))?;
                writer.write_event(Event::End(BytesEnd::new("format")))?;
            }
            writer.write_event(Event::End(BytesEnd::new("formats")))?;
            writer.write_event(Event::End(BytesEnd::new("wafermap")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("wafermaps")))?;
        writer.write_event(Event::End(BytesEnd::new("wafer")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("lot")))?;
    Ok(writer.into_inner())
}

fn write_parameters(
    writer: &mut Writer<Vec<u8>>,
    container: &str,
    parameters: &IndexMap<String, String>,
) -> Result<(), MapmergeError> {
    writer.write_event(Event::Start(BytesStart::new(container)))?;
    for (key, value) in parameters {
        let mut elem = BytesStart::new("parameter");
        elem.push_attribute(("key", key.as_str()));
        elem.push_attribute(("value", value.as_str()));
        writer.write_event(Event::Empty(elem))?;
    }
    writer.write_event(Event::End(BytesEnd::new(container)))?;
    Ok(())
}

fn attr_map(e: &BytesStart<'_>) -> Result<IndexMap<String, String>, MapmergeError> {
    let mut attrs = IndexMap::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

fn attr(attrs: &IndexMap<String, String>, key: &str) -> String {
    attrs.get(key).cloned().unwrap_or_default()
}

fn lot_from_attrs(attrs: &IndexMap<String, String>) -> Lot {
    Lot::new(
        attr(attrs, "name"),
        attr(attrs, "item"),
        attr(attrs, "wafersInLot"),
        attr(attrs, "organization"),
        attr(attrs, "probelocation"),
        attr(attrs, "subcontractor"),
    )
}

fn parse_lot(
    reader: &mut Reader<&[u8]>,
    attrs: IndexMap<String, String>,
) -> Result<Lot, MapmergeError> {
    let mut lot = lot_from_attrs(&attrs);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"configuration-parameters" => {
                    let parameters = parse_parameters(reader, "configuration-parameters")?;
                    lot.config.extend(parameters);
                }
                b"wafer" => {
                    let attrs = attr_map(&e)?;
                    lot.wafers.push(parse_wafer(reader, attrs)?);
                }
                name => return Err(unexpected(name, "lot")),
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"configuration-parameters" => {}
                b"wafer" => {
                    let attrs = attr_map(&e)?;
                    lot.wafers
                        .push(Wafer::new(attr(&attrs, "number"), attr(&attrs, "passdies")));
                }
                name => return Err(unexpected(name, "lot")),
            },
            Event::End(e) if e.local_name().as_ref() == b"lot" => return Ok(lot),
            Event::End(e) => return Err(unexpected_end(&e)),
            Event::Text(_) | Event::Comment(_) => {}
            Event::Eof => {
                return Err(MapmergeError::Decode(
                    "lot element was never closed".to_string(),
                ));
            }
            other => return Err(MapmergeError::Decode(format!("unexpected {:?} in lot", other))),
        }
        buf.clear();
    }
}

fn parse_parameters(
    reader: &mut Reader<&[u8]>,
    container: &str,
) -> Result<IndexMap<String, String>, MapmergeError> {
    let mut parameters = IndexMap::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Empty(e) | Event::Start(e) if e.local_name().as_ref() == b"parameter" => {
                let attrs = attr_map(&e)?;
                parameters.insert(attr(&attrs, "key"), attr(&attrs, "value"));
            }
            Event::End(e) if e.local_name().as_ref() == container.as_bytes() => {
                return Ok(parameters);
            }
            Event::End(e) if e.local_name().as_ref() == b"parameter" => {}
            Event::Text(_) | Event::Comment(_) => {}
            Event::Eof => {
                return Err(MapmergeError::Decode(format!(
                    "{} was never closed",
                    container
                )));
            }
            other => {
                return Err(MapmergeError::Decode(format!(
                    "unexpected {:?} in {}",
                    other, container
                )));
            }
        }
        buf.clear();
    }
}

fn parse_wafer(
    reader: &mut Reader<&[u8]>,
    attrs: IndexMap<String, String>,
) -> Result<Wafer, MapmergeError> {
    let mut wafer = Wafer::new(attr(&attrs, "number"), attr(&attrs, "passdies"));
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"wafer-properties" => {
                    let parameters = parse_parameters(reader, "wafer-properties")?;
                    wafer.config.extend(parameters);
                }
                b"wafermaps" => {
                    wafer.wafermaps.extend(parse_wafermaps(reader)?);
                }
                name => return Err(unexpected(name, "wafer")),
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"wafer-properties" | b"wafermaps" => {}
                name => return Err(unexpected(name, "wafer")),
            },
            Event::End(e) if e.local_name().as_ref() == b"wafer" => return Ok(wafer),
            Event::End(e) => return Err(unexpected_end(&e)),
            Event::Text(_) | Event::Comment(_) => {}
            Event::Eof => {
                return Err(MapmergeError::Decode(
                    "wafer element was never closed".to_string(),
                ));
            }
            other => {
                return Err(MapmergeError::Decode(format!(
                    "unexpected {:?} in wafer",
                    other
                )));
            }
        }
        buf.clear();
    }
}

fn parse_wafermaps(reader: &mut Reader<&[u8]>) -> Result<Vec<Wafermap>, MapmergeError> {
    let mut wafermaps = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"wafermap" => {
                let attrs = attr_map(&e)?;
                wafermaps.push(parse_wafermap(reader, attr(&attrs, "name"))?);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"wafermap" => {
                let attrs = attr_map(&e)?;
                wafermaps.push(Wafermap::new(attr(&attrs, "name")));
            }
            Event::End(e) if e.local_name().as_ref() == b"wafermaps" => return Ok(wafermaps),
            Event::End(e) => return Err(unexpected_end(&e)),
            Event::Text(_) | Event::Comment(_) => {}
            Event::Eof => {
                return Err(MapmergeError::Decode(
                    "wafermaps element was never closed".to_string(),
                ));
            }
            other => {
                return Err(MapmergeError::Decode(format!(
                    "unexpected {:?} in wafermaps",
                    other
                )));
            }
        }
        buf.clear();
    }
}

fn parse_wafermap(reader: &mut Reader<&[u8]>, name: String) -> Result<Wafermap, MapmergeError> {
    let mut wafermap = Wafermap::new(name);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            // The original documents wrap each format in its own <formats>
            // block, so repeated blocks per wafermap are accepted.
            Event::Start(e) if e.local_name().as_ref() == b"formats" => {
                parse_formats(reader, &mut wafermap)?;
            }
            Event::Empty(e) if e.local_name().as_ref() == b"formats" => {}
            Event::End(e) if e.local_name().as_ref() == b"wafermap" => return Ok(wafermap),
            Event::End(e) => return Err(unexpected_end(&e)),
            Event::Start(e) | Event::Empty(e) => {
                return Err(unexpected(e.local_name().as_ref(), "wafermap"));
            }
            Event::Text(_) | Event::Comment(_) => {}
            Event::Eof => {
                return Err(MapmergeError::Decode(
                    "wafermap element was never closed".to_string(),
                ));
            }
            other => {
                return Err(MapmergeError::Decode(format!(
                    "unexpected {:?} in wafermap",
                    other
                )));
            }
        }
        buf.clear();
    }
}

fn parse_formats(
    reader: &mut Reader<&[u8]>,
    wafermap: &mut Wafermap,
) -> Result<(), MapmergeError> {
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"format" => {
                let attrs = attr_map(&e)?;
                let text = parse_format_text(reader)?;
                let format = build_format(&attrs, &text)?;
                wafermap.set_format(&attr(&attrs, "name"), format);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"format" => {
                let attrs = attr_map(&e)?;
                let format = build_format(&attrs, "")?;
                wafermap.set_format(&attr(&attrs, "name"), format);
            }
            Event::End(e) if e.local_name().as_ref() == b"formats" => return Ok(()),
            Event::End(e) => return Err(unexpected_end(&e)),
            Event::Start(e) | Event::Empty(e) => {
                return Err(unexpected(e.local_name().as_ref(), "formats"));
            }
            Event::Text(_) | Event::Comment(_) => {}
            Event::Eof => {
                return Err(MapmergeError::Decode(
                    "formats element was never closed".to_string(),
                ));
            }
            other => {
                return Err(MapmergeError::Decode(format!(
                    "unexpected {:?} in formats",
                    other
                )));
            }
        }
        buf.clear();
    }
}

/// Accumulate the text content of one format element up to its closing tag.
fn parse_format_text(reader: &mut Reader<&[u8]>) -> Result<String, MapmergeError> {
    let mut text = String::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Text(e) => text.push_str(&e.unescape()?),
            Event::CData(e) => text.push_str(&String::from_utf8_lossy(&e.into_inner())),
            Event::End(e) if e.local_name().as_ref() == b"format" => {
                return Ok(text.trim().to_string());
            }
            Event::Comment(_) => {}
            Event::Eof => {
                return Err(MapmergeError::Decode(
                    "format element was never closed".to_string(),
                ));
            }
            other => {
                return Err(MapmergeError::Decode(format!(
                    "unexpected {:?} in format",
                    other
                )));
            }
        }
        buf.clear();
    }
}

fn build_format(
    attrs: &IndexMap<String, String>,
    text: &str,
) -> Result<Format, MapmergeError> {
    match attrs.get("encoding").map(String::as_str) {
        Some("base64") => {
            let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            Ok(Format::Inline(BASE64.decode(compact.as_bytes())?))
        }
        Some(other) => Err(MapmergeError::Decode(format!(
            "unknown format encoding {}",
            other
        ))),
        None => Ok(Format::Referenced(text.to_string())),
    }
}

fn unexpected(name: &[u8], context: &str) -> MapmergeError {
    MapmergeError::Decode(format!(
        "unexpected element {} inside {}",
        String::from_utf8_lossy(name),
        context
    ))
}

fn unexpected_end(e: &BytesEnd<'_>) -> MapmergeError {
    MapmergeError::Decode(format!(
        "unexpected closing tag {}",
        String::from_utf8_lossy(e.local_name().as_ref())
    ))
}
