use crate::error::UpdaterError;
use crate::platform::build_number::{BuildNumber, BuildRange};
use crate::platform::model::{
    Build, Button, Channel, ChannelLicensing, ChannelStatus, Patch, Product, TargetOs,
    UpdatesInfo,
};
use chrono::NaiveDate;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
enum TextTarget {
    Code,
    Message,
}

#[derive(Default)]
struct ParserState {
    products: Vec<Product>,
    product: Option<Product>,
    channel: Option<Channel>,
    build: Option<Build>,
    text_target: Option<TextTarget>,
}

/// Parse an update metadata document (`<products><product>...</product></products>`).
///
/// Missing mandatory attributes fail the whole document.
pub fn parse_updates_info(xml: &str) -> Result<UpdatesInfo, UpdaterError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut state = ParserState::default();

    loop {
        match reader.read_event()? {
            Event::Start(element) => state.open(&element)?,
            Event::Empty(element) => {
                state.open(&element)?;
                state.close(element.name().as_ref())?;
            }
            Event::End(element) => state.close(element.name().as_ref())?,
            Event::Text(text) => state.text(&text.unescape()?),
            Event::CData(data) => state.text(&String::from_utf8_lossy(&data.into_inner())),
            Event::Eof => break,
            _ => {}
        }
    }

    if state.product.is_some() {
        return Err(malformed("unterminated <product> element"));
    }

    Ok(UpdatesInfo {
        products: state.products,
    })
}

impl ParserState {
    fn open(&mut self, element: &BytesStart) -> Result<(), UpdaterError> {
        match element.name().as_ref() {
            b"product" => {
                let attrs = attributes(element)?;
                self.product = Some(Product {
                    name: required(&attrs, "name", "product")?,
                    codes: Vec::new(),
                    channels: Vec::new(),
                    disable_machine_id: flag(&attrs, "disableMachineId"),
                });
            }
            b"code" => self.text_target = Some(TextTarget::Code),
            b"channel" => {
                if self.product.is_none() {
                    return Err(malformed("<channel> outside of <product>"));
                }

                let attrs = attributes(element)?;
                self.channel = Some(Channel {
                    id: required(&attrs, "id", "channel")?,
                    status: ChannelStatus::from_code(
                        attrs.get("status").map(String::as_str).unwrap_or_default(),
                    ),
                    licensing: ChannelLicensing::from_code(
                        attrs.get("licensing").map(String::as_str).unwrap_or_default(),
                    ),
                    eval_days: attrs.get("evalDays").and_then(|v| v.parse().ok()),
                    url: attrs.get("url").cloned(),
                    builds: Vec::new(),
                });
            }
            b"build" => {
                if self.channel.is_none() {
                    return Err(malformed("<build> outside of <channel>"));
                }

                let attrs = attributes(element)?;
                let raw_number = attrs
                    .get("fullNumber")
                    .or_else(|| attrs.get("number"))
                    .ok_or_else(|| malformed("<build> is missing attribute number"))?;
                let number = BuildNumber::parse(raw_number)?;

                let api_version = match attrs.get("apiVersion") {
                    Some(v) => BuildNumber::parse(v)?,
                    None => number.clone(),
                };

                let release_date = attrs.get("releaseDate").and_then(|v| {
                    let parsed = NaiveDate::parse_from_str(v, "%Y%m%d").ok();
                    if parsed.is_none() {
                        tracing::debug!("Ignoring unparsable release date {:?}", v);
                    }
                    parsed
                });

                let target = BuildRange::new(
                    attrs.get("targetSince").map(|v| BuildNumber::parse(v)).transpose()?,
                    attrs.get("targetUntil").map(|v| BuildNumber::parse(v)).transpose()?,
                );

                self.build = Some(Build {
                    number,
                    api_version,
                    version: attrs.get("version").cloned().unwrap_or_default(),
                    release_date,
                    target,
                    message: None,
                    buttons: Vec::new(),
                    patches: Vec::new(),
                });
            }
            b"message" => self.text_target = Some(TextTarget::Message),
            b"patch" => {
                let attrs = attributes(element)?;
                let build = self
                    .build
                    .as_mut()
                    .ok_or_else(|| malformed("<patch> outside of <build>"))?;

                let raw_from = attrs
                    .get("fullFrom")
                    .or_else(|| attrs.get("from"))
                    .ok_or_else(|| malformed("<patch> is missing attribute from"))?;

                let exclusions = attrs
                    .get("exclusions")
                    .map(|v| v.split(',').filter_map(TargetOs::from_code).collect())
                    .unwrap_or_default();

                build.patches.push(Patch {
                    from: BuildNumber::parse(raw_from)?,
                    size: attrs.get("size").cloned(),
                    exclusions,
                });
            }
            b"button" => {
                let attrs = attributes(element)?;
                let build = self
                    .build
                    .as_mut()
                    .ok_or_else(|| malformed("<button> outside of <build>"))?;

                build.buttons.push(Button {
                    name: attrs.get("name").cloned().unwrap_or_default(),
                    url: required(&attrs, "url", "button")?,
                    download: flag(&attrs, "download"),
                });
            }
            _ => {}
        }

        Ok(())
    }

    fn close(&mut self, name: &[u8]) -> Result<(), UpdaterError> {
        match name {
            b"product" => {
                if let Some(product) = self.product.take() {
                    self.products.push(product);
                }
            }
            b"channel" => {
                if let (Some(channel), Some(product)) = (self.channel.take(), self.product.as_mut()) {
                    product.channels.push(channel);
                }
            }
            b"build" => {
                if let (Some(build), Some(channel)) = (self.build.take(), self.channel.as_mut()) {
                    channel.builds.push(build);
                }
            }
            b"code" | b"message" => self.text_target = None,
            _ => {}
        }

        Ok(())
    }

    fn text(&mut self, text: &str) {
        match self.text_target {
            Some(TextTarget::Code) => {
                if let Some(product) = self.product.as_mut() {
                    product.codes.push(text.to_owned());
                }
            }
            Some(TextTarget::Message) => {
                if let Some(build) = self.build.as_mut() {
                    build.message.get_or_insert_with(String::new).push_str(text);
                }
            }
            None => {}
        }
    }
}

fn attributes(element: &BytesStart) -> Result<HashMap<String, String>, UpdaterError> {
    let mut attrs = HashMap::new();

    for attr in element.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        attrs.insert(key, attr.unescape_value()?.into_owned());
    }

    Ok(attrs)
}

fn required(
    attrs: &HashMap<String, String>,
    name: &str,
    element: &str,
) -> Result<String, UpdaterError> {
    attrs
        .get(name)
        .cloned()
        .ok_or_else(|| malformed(&format!("<{}> is missing attribute {}", element, name)))
}

fn flag(attrs: &HashMap<String, String>, name: &str) -> bool {
    attrs.get(name).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn malformed(message: &str) -> UpdaterError {
    UpdaterError::MalformedMetadata(message.to_owned())
}
