//! Process definitions and the deployment-time outline parser.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowforge_core::{DeploymentId, ProcessDefinitionId};

use super::DefinitionError;

/// What the engine needs to know about a deployed process without executing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutline {
    pub process_id: String,
    pub name: Option<String>,
    /// Contains at least one timer event definition
    pub has_timers: bool,
    /// Contains at least one asynchronous continuation
    pub has_async: bool,
}

/// A deployed, parsed process definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: ProcessDefinitionId,
    /// Process key; versions are numbered per key
    pub key: String,
    pub version: u32,
    pub name: Option<String>,
    pub deployment_id: DeploymentId,
    pub resource_name: String,
    pub resource: String,
    pub outline: ProcessOutline,
    pub deployed_at: DateTime<Utc>,
}

impl ProcessDefinition {
    /// Parse a deployment resource into version 1 of its process key.
    ///
    /// The store renumbers the version on deploy.
    pub fn parse(
        resource_name: impl Into<String>,
        resource: impl Into<String>,
        safe_xml: bool,
        now: DateTime<Utc>,
    ) -> Result<Self, DefinitionError> {
        let resource = resource.into();
        let outline = parse_outline(&resource, safe_xml)?;

        Ok(Self {
            id: ProcessDefinitionId::new(),
            key: outline.process_id.clone(),
            version: 1,
            name: outline.name.clone(),
            deployment_id: DeploymentId::new(),
            resource_name: resource_name.into(),
            resource,
            outline,
            deployed_at: now,
        })
    }
}

pub fn parse_outline(xml: &str, safe_xml: bool) -> Result<ProcessOutline, DefinitionError> {
    use quick_xml::Reader;
    use quick_xml::events::Event;

    if xml.trim().is_empty() {
        return Err(DefinitionError::Invalid("empty resource".to_string()));
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut process: Option<(Option<String>, Option<String>)> = None;
    let mut has_timers = false;
    let mut has_async = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e) | Event::Empty(e)) => {
                let attributes = element_attributes(&e)?;
                has_async |= attributes.iter().any(|(k, v)| k == "async" && v == "true");

                match e.local_name().as_ref() {
                    b"process" if process.is_none() => {
                        let find = |name: &str| {
                            attributes.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
                        };
                        process = Some((find("id"), find("name")));
                    }
                    b"timerEventDefinition" => has_timers = true,
                    _ => {}
                }
            }
            // Entity declarations can only appear inside the DOCTYPE
            Ok(Event::DocType(_)) if safe_xml => {
                return Err(DefinitionError::UnsafeXml("a DOCTYPE declaration".to_string()));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(malformed(e)),
        }
    }

    let (id, name) =
        process.ok_or_else(|| DefinitionError::Invalid("no <process> element".to_string()))?;
    let process_id = id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| DefinitionError::Invalid("<process> has no id".to_string()))?;

    Ok(ProcessOutline {
        process_id,
        name,
        has_timers,
        has_async,
    })
}

/// Unescaped attributes keyed by local name (`flowable:async` -> `async`).
fn element_attributes(
    element: &quick_xml::events::BytesStart<'_>,
) -> Result<Vec<(String, String)>, DefinitionError> {
    element
        .attributes()
        .map(|attr| -> Result<(String, String), DefinitionError> {
            let attr = attr.map_err(malformed)?;
            let key = std::str::from_utf8(attr.key.local_name().as_ref())
                .map_err(malformed)?
                .to_string();
            let value = attr.unescape_value().map_err(malformed)?.into_owned();
            Ok((key, value))
        })
        .collect()
}

fn malformed(e: impl std::fmt::Display) -> DefinitionError {
    DefinitionError::Invalid(format!("malformed XML: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL" xmlns:flowable="http://flowable.org/bpmn">
  <process id="order" name="Order handling" isExecutable="true">
    <startEvent id="start"/>
    <serviceTask id="charge" flowable:async="true" flowable:class="x.Charge"/>
    <boundaryEvent id="late" attachedToRef="charge">
      <timerEventDefinition><timeDuration>PT1H</timeDuration></timerEventDefinition>
    </boundaryEvent>
    <endEvent id="end"/>
  </process>
</definitions>"#;

    #[test]
    fn parses_outline() {
        let outline = parse_outline(ORDER, true).unwrap();
        assert_eq!(outline.process_id, "order");
        assert_eq!(outline.name.as_deref(), Some("Order handling"));
        assert!(outline.has_timers);
        assert!(outline.has_async);
    }

    #[test]
    fn prefixed_process_element() {
        let xml = r#"<bpmn:definitions><bpmn:process id='p1'><bpmn:task id='t'/></bpmn:process></bpmn:definitions>"#;
        let outline = parse_outline(xml, true).unwrap();
        assert_eq!(outline.process_id, "p1");
        assert!(outline.name.is_none());
        assert!(!outline.has_timers);
        assert!(!outline.has_async);
    }

    #[test]
    fn safe_xml_rejects_doctype_and_entities() {
        let xml = r#"<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]><definitions><process id="p"/></definitions>"#;
        assert!(matches!(parse_outline(xml, true), Err(DefinitionError::UnsafeXml(_))));
        // Without the guard the document parses
        assert_eq!(parse_outline(xml, false).unwrap().process_id, "p");
    }

    #[test]
    fn missing_process_is_invalid() {
        assert!(matches!(
            parse_outline("<definitions/>", true),
            Err(DefinitionError::Invalid(_))
        ));
        assert!(matches!(parse_outline("   ", true), Err(DefinitionError::Invalid(_))));
        assert!(matches!(
            parse_outline("<definitions><process name='x'/></definitions>", true),
            Err(DefinitionError::Invalid(_))
        ));
    }

    #[test]
    fn commented_out_process_is_ignored() {
        let xml = r#"<definitions><!-- old: <process id="legacy"/> --><process id="order"/></definitions>"#;
        assert_eq!(parse_outline(xml, true).unwrap().process_id, "order");
    }

    #[test]
    fn attribute_values_are_unescaped() {
        let xml = r#"<definitions><process id="returns" name="Orders &amp; Returns"/></definitions>"#;
        let outline = parse_outline(xml, true).unwrap();
        assert_eq!(outline.name.as_deref(), Some("Orders & Returns"));
    }

    #[test]
    fn angle_bracket_inside_attribute_value() {
        let xml = r#"<definitions><process name="a > b" id="p"/></definitions>"#;
        let outline = parse_outline(xml, true).unwrap();
        assert_eq!(outline.process_id, "p");
        assert_eq!(outline.name.as_deref(), Some("a > b"));
    }

    #[test]
    fn markup_inside_cdata_is_text() {
        let xml = r#"<definitions><process id="p">
  <documentation><![CDATA[add a <timerEventDefinition> later, maybe async="true"]]></documentation>
  <task id="t"/>
</process></definitions>"#;
        let outline = parse_outline(xml, true).unwrap();
        assert!(!outline.has_timers);
        assert!(!outline.has_async);
    }

    #[test]
    fn mismatched_tags_are_invalid() {
        assert!(matches!(
            parse_outline("<definitions><process id='p'></definitions>", true),
            Err(DefinitionError::Invalid(_))
        ));
    }

    #[test]
    fn parse_uses_process_id_as_key() {
        let def = ProcessDefinition::parse("order.bpmn20.xml", ORDER, true, Utc::now()).unwrap();
        assert_eq!(def.key, "order");
        assert_eq!(def.version, 1);
        assert_eq!(def.resource_name, "order.bpmn20.xml");
    }
}
