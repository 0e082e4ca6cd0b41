//! Directory queries: device lists and contacts (usync), group metadata, presence.

use super::{server_jid, Client};
use crate::binary::Node;
use crate::error::Error;
use crate::types::{from_unix, Jid, Server};
use crate::Result;
use std::collections::HashMap;
use std::time::SystemTime;
use tracing::debug;

/// Group metadata.
#[derive(Clone, Debug)]
pub struct GroupInfo {
    pub jid: Jid,
    pub name: String,
    pub owner: Option<Jid>,
    pub created: Option<SystemTime>,
    pub participants: Vec<GroupParticipant>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupParticipant {
    pub jid: Jid,
    pub is_admin: bool,
    pub is_super_admin: bool,
}

/// Registration status of one phone number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IsOnWhatsAppResponse {
    /// The number as it was queried.
    pub query: String,
    pub jid: Jid,
    pub is_in: bool,
}

/// Profile data of one user.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub status: Option<String>,
    pub picture_id: Option<String>,
    pub verified_name: Option<String>,
    pub devices: Vec<Jid>,
}

/// Typing indicator state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatPresence {
    Composing,
    Paused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatPresenceMedia {
    Text,
    Audio,
}

fn usync_request(sid: &str, context: &str, mode: &str, query: Vec<Node>, users: Vec<Node>) -> Node {
    Node::new("usync")
        .with_attr("sid", sid)
        .with_attr("mode", mode)
        .with_attr("last", "true")
        .with_attr("index", 0)
        .with_attr("context", context)
        .with_children(vec![
            Node::new("query").with_children(query),
            Node::new("list").with_children(users),
        ])
}

fn usync_node(sid: &str, users: &[Jid]) -> Node {
    usync_request(
        sid,
        "message",
        "query",
        vec![Node::new("devices").with_attr("version", 2)],
        users
            .iter()
            .map(|u| Node::new("user").with_attr("jid", u))
            .collect(),
    )
}

fn usync_users<'a>(resp: &'a Node) -> Result<impl Iterator<Item = &'a Node> + 'a> {
    let list = resp
        .get_optional_child_by_path(&["usync", "list"])
        .ok_or_else(|| Error::ProtocolViolation("usync response without list".into()))?;
    Ok(list.get_children_by_tag("user"))
}

fn device_list(user: &Node, jid: &Jid) -> Vec<Jid> {
    user.get_optional_child_by_path(&["devices", "device-list"])
        .map(|dl| {
            dl.get_children_by_tag("device")
                .filter_map(|d| d.attr_u64("id"))
                .filter_map(|id| u16::try_from(id).ok())
                .map(|id| jid.with_device(id))
                .collect()
        })
        .unwrap_or_default()
}

/// Device JIDs per user from a usync response.
fn parse_device_lists(resp: &Node) -> Result<HashMap<Jid, Vec<Jid>>> {
    let mut out = HashMap::new();
    for user in usync_users(resp)? {
        let jid = user.require_jid("jid")?.to_non_ad();
        let devices = device_list(user, &jid);
        out.insert(jid, devices);
    }
    Ok(out)
}

fn text(node: &Node) -> Option<String> {
    node.bytes()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .filter(|s| !s.is_empty())
}

/// Phone numbers in the `+<digits>` form the contact query expects.
fn normalize_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    format!("+{}", digits)
}

fn parse_contacts(resp: &Node) -> Result<Vec<IsOnWhatsAppResponse>> {
    usync_users(resp)?
        .map(|user| {
            let contact = user
                .get_child_by_tag("contact")
                .ok_or_else(|| Error::ProtocolViolation("usync user without <contact>".into()))?;
            Ok(IsOnWhatsAppResponse {
                query: text(contact).unwrap_or_default(),
                jid: user.require_jid("jid")?,
                is_in: contact.attr("type") == Some("in"),
            })
        })
        .collect()
}

fn parse_user_info(resp: &Node) -> Result<HashMap<Jid, UserInfo>> {
    let mut out = HashMap::new();
    for user in usync_users(resp)? {
        let jid = user.require_jid("jid")?.to_non_ad();
        let info = UserInfo {
            status: user.get_child_by_tag("status").and_then(text),
            picture_id: user
                .get_child_by_tag("picture")
                .and_then(|p| p.attr("id"))
                .map(str::to_string),
            verified_name: user
                .get_optional_child_by_path(&["business", "verified_name"])
                .and_then(|v| v.attr("name"))
                .map(str::to_string),
            devices: device_list(user, &jid),
        };
        out.insert(jid, info);
    }
    Ok(out)
}

fn parse_group_node(group: &Node, fallback: Option<&Jid>) -> Result<GroupInfo> {
    let participants = group
        .get_children_by_tag("participant")
        .map(|p| {
            let kind = p.attr("type");
            Ok(GroupParticipant {
                jid: p.require_jid("jid")?,
                is_admin: matches!(kind, Some("admin") | Some("superadmin")),
                is_super_admin: kind == Some("superadmin"),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let jid = match (group.attr("id"), fallback) {
        (Some(id), _) => Jid::new(id, Server::Group),
        (None, Some(jid)) => jid.clone(),
        (None, None) => return Err(Error::ProtocolViolation("<group> without id".into())),
    };
    Ok(GroupInfo {
        jid,
        name: group.attr("subject").unwrap_or_default().to_string(),
        owner: group.attr_jid("creator"),
        created: group.attr_u64("creation").map(from_unix),
        participants,
    })
}

fn parse_group(node: &Node, jid: &Jid) -> Result<GroupInfo> {
    let group = node
        .get_child_by_tag("group")
        .ok_or_else(|| Error::ProtocolViolation("group response without <group>".into()))?;
    parse_group_node(group, Some(jid))
}

fn parse_joined_groups(node: &Node) -> Result<Vec<GroupInfo>> {
    let groups = node
        .get_child_by_tag("groups")
        .ok_or_else(|| Error::ProtocolViolation("participating response without <groups>".into()))?;
    groups
        .get_children_by_tag("group")
        .map(|g| parse_group_node(g, None))
        .collect()
}

fn chat_presence_node(own: &Jid, to: &Jid, state: ChatPresence, media: ChatPresenceMedia) -> Node {
    let mut child = Node::new(match state {
        ChatPresence::Composing => "composing",
        ChatPresence::Paused => "paused",
    });
    if state == ChatPresence::Composing && media == ChatPresenceMedia::Audio {
        child = child.with_attr("media", "audio");
    }
    Node::new("chatstate")
        .with_attr("from", own.to_non_ad())
        .with_attr("to", to)
        .with_children(vec![child])
}

impl Client {
    /// All device JIDs of the given users, from cache where possible.
    pub async fn get_user_devices(&self, users: &[Jid]) -> Result<Vec<Jid>> {
        let mut devices = Vec::new();
        let mut missing = Vec::new();
        {
            let cache = self.inner.device_cache.lock().unwrap_or_else(|e| e.into_inner());
            for user in users {
                let user = user.to_non_ad();
                match cache.get(&user) {
                    Some(cached) => devices.extend(cached.iter().cloned()),
                    None if !missing.contains(&user) => missing.push(user),
                    None => {}
                }
            }
        }
        if missing.is_empty() {
            return Ok(devices);
        }

        let sid = self.inner.pending.next_id();
        let resp = self
            .query_idempotent("usync", "get", &server_jid(), vec![usync_node(&sid, &missing)])
            .await?;
        let fetched = parse_device_lists(&resp)?;
        debug!(users = missing.len(), "fetched device lists");
        let mut cache = self.inner.device_cache.lock().unwrap_or_else(|e| e.into_inner());
        for (user, list) in fetched {
            devices.extend(list.iter().cloned());
            cache.insert(user, list);
        }
        Ok(devices)
    }

    /// Forget the cached device list of `user` (device added or removed).
    pub(super) fn invalidate_devices(&self, user: &Jid) {
        self.inner
            .device_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&user.to_non_ad());
    }

    /// Which of `phones` are registered. Numbers may carry formatting; only digits are sent.
    pub async fn is_on_whatsapp(&self, phones: &[&str]) -> Result<Vec<IsOnWhatsAppResponse>> {
        if phones.is_empty() {
            return Ok(Vec::new());
        }
        let users = phones
            .iter()
            .map(|p| Node::new("user").with_children(vec![Node::new("contact").with_content(normalize_phone(p))]))
            .collect();
        let sid = self.inner.pending.next_id();
        let usync = usync_request(&sid, "interactive", "query", vec![Node::new("contact")], users);
        let resp = self
            .query_idempotent("usync", "get", &server_jid(), vec![usync])
            .await?;
        parse_contacts(&resp)
    }

    /// Status text, picture id, business name and devices of each user. Device lists
    /// refresh the send cache.
    pub async fn get_user_info(&self, jids: &[Jid]) -> Result<HashMap<Jid, UserInfo>> {
        if jids.is_empty() {
            return Ok(HashMap::new());
        }
        let query = vec![
            Node::new("business").with_children(vec![Node::new("verified_name")]),
            Node::new("status"),
            Node::new("picture"),
            Node::new("devices").with_attr("version", 2),
        ];
        let users = jids
            .iter()
            .map(|j| Node::new("user").with_attr("jid", j.to_non_ad()))
            .collect();
        let sid = self.inner.pending.next_id();
        let usync = usync_request(&sid, "background", "full", query, users);
        let resp = self
            .query_idempotent("usync", "get", &server_jid(), vec![usync])
            .await?;
        let infos = parse_user_info(&resp)?;
        let mut cache = self.inner.device_cache.lock().unwrap_or_else(|e| e.into_inner());
        for (jid, info) in &infos {
            if !info.devices.is_empty() {
                cache.insert(jid.clone(), info.devices.clone());
            }
        }
        Ok(infos)
    }

    pub async fn get_group_info(&self, group: &Jid) -> Result<GroupInfo> {
        if !group.is_group() {
            return Err(Error::ProtocolViolation(format!("{} is not a group", group)));
        }
        let resp = self
            .query_idempotent(
                "w:g2",
                "get",
                group,
                vec![Node::new("query").with_attr("request", "interactive")],
            )
            .await?;
        parse_group(&resp, group)
    }

    /// Every group this account participates in.
    pub async fn get_joined_groups(&self) -> Result<Vec<GroupInfo>> {
        let resp = self
            .query_idempotent(
                "w:g2",
                "get",
                &Jid::server(Server::Group),
                vec![Node::new("participating").with_children(vec![
                    Node::new("participants"),
                    Node::new("description"),
                ])],
            )
            .await?;
        parse_joined_groups(&resp)
    }

    /// Ask the server for presence updates of `jid`; they arrive as `Event::Presence`.
    pub async fn subscribe_presence(&self, jid: &Jid) -> Result<()> {
        self.send_node(
            &Node::new("presence")
                .with_attr("type", "subscribe")
                .with_attr("to", jid.to_non_ad()),
        )
        .await
    }

    /// Typing or recording indicator in the chat with `to`.
    pub async fn send_chat_presence(
        &self,
        to: &Jid,
        state: ChatPresence,
        media: ChatPresenceMedia,
    ) -> Result<()> {
        let own = self.get_own_id().await.ok_or(Error::NotLoggedIn)?;
        self.send_node(&chat_presence_node(&own, to, state, media))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::iq_node;

    #[test]
    fn device_lists_from_usync() {
        let resp = iq_node(
            "usync",
            "result",
            &server_jid(),
            vec![Node::new("usync").with_children(vec![Node::new("list").with_children(vec![
                Node::new("user")
                    .with_attr("jid", "111@s.whatsapp.net")
                    .with_children(vec![Node::new("devices").with_children(vec![
                        Node::new("device-list").with_children(vec![
                            Node::new("device").with_attr("id", 0),
                            Node::new("device").with_attr("id", 5).with_attr("key-index", 1),
                        ]),
                    ])]),
                Node::new("user").with_attr("jid", "222@s.whatsapp.net"),
            ])])],
        );
        let lists = parse_device_lists(&resp).unwrap();
        let user: Jid = "111@s.whatsapp.net".parse().unwrap();
        assert_eq!(lists[&user], vec![user.with_device(0), user.with_device(5)]);
        assert!(lists[&"222@s.whatsapp.net".parse::<Jid>().unwrap()].is_empty());
    }

    #[test]
    fn group_roles() {
        let jid: Jid = "123-456@g.us".parse().unwrap();
        let resp = Node::new("iq").with_children(vec![Node::new("group")
            .with_attr("id", "123-456")
            .with_attr("subject", "Team")
            .with_attr("creator", "111@s.whatsapp.net")
            .with_attr("creation", 1_700_000_000)
            .with_children(vec![
                Node::new("participant")
                    .with_attr("jid", "111@s.whatsapp.net")
                    .with_attr("type", "superadmin"),
                Node::new("participant")
                    .with_attr("jid", "222@s.whatsapp.net")
                    .with_attr("type", "admin"),
                Node::new("participant").with_attr("jid", "333@s.whatsapp.net"),
            ])]);
        let info = parse_group(&resp, &jid).unwrap();
        assert_eq!(info.jid, jid);
        assert_eq!(info.name, "Team");
        assert_eq!(info.participants.len(), 3);
        assert!(info.participants[0].is_super_admin && info.participants[0].is_admin);
        assert!(info.participants[1].is_admin && !info.participants[1].is_super_admin);
        assert!(!info.participants[2].is_admin);
    }

    fn usync_result(users: Vec<Node>) -> Node {
        iq_node(
            "usync",
            "result",
            &server_jid(),
            vec![Node::new("usync").with_children(vec![Node::new("list").with_children(users)])],
        )
    }

    #[test]
    fn contact_query_shape() {
        assert_eq!(normalize_phone("+55 (11) 99999-0000"), "+5511999990000");
        let req = usync_request(
            "sid-1",
            "interactive",
            "query",
            vec![Node::new("contact")],
            vec![Node::new("user").with_children(vec![Node::new("contact").with_content("+5511")])],
        );
        assert_eq!(req.attr("context"), Some("interactive"));
        assert!(req.get_optional_child_by_path(&["query", "contact"]).is_some());
        let contact = req
            .get_optional_child_by_path(&["list", "user", "contact"])
            .unwrap();
        assert_eq!(contact.bytes(), Some(&b"+5511"[..]));

        let resp = usync_result(vec![
            Node::new("user")
                .with_attr("jid", "5511@s.whatsapp.net")
                .with_children(vec![Node::new("contact").with_attr("type", "in").with_content("+5511")]),
            Node::new("user")
                .with_attr("jid", "5522@s.whatsapp.net")
                .with_children(vec![Node::new("contact").with_attr("type", "out").with_content("+5522")]),
        ]);
        let found = parse_contacts(&resp).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].query, "+5511");
        assert!(found[0].is_in);
        assert_eq!(found[1].jid, Jid::user("5522"));
        assert!(!found[1].is_in);
    }

    #[test]
    fn user_info_fields() {
        let resp = usync_result(vec![Node::new("user")
            .with_attr("jid", "111@s.whatsapp.net")
            .with_children(vec![
                Node::new("status").with_content("at work"),
                Node::new("picture").with_attr("id", "17"),
                Node::new("business").with_children(vec![Node::new("verified_name").with_attr("name", "Shop")]),
                Node::new("devices").with_children(vec![Node::new("device-list").with_children(vec![
                    Node::new("device").with_attr("id", 0),
                    Node::new("device").with_attr("id", 2),
                ])]),
            ])]);
        let infos = parse_user_info(&resp).unwrap();
        let user = Jid::user("111");
        let info = &infos[&user];
        assert_eq!(info.status.as_deref(), Some("at work"));
        assert_eq!(info.picture_id.as_deref(), Some("17"));
        assert_eq!(info.verified_name.as_deref(), Some("Shop"));
        assert_eq!(info.devices, vec![user.with_device(0), user.with_device(2)]);
    }

    #[test]
    fn joined_groups_list() {
        let resp = Node::new("iq").with_children(vec![Node::new("groups").with_children(vec![
            Node::new("group").with_attr("id", "1-1").with_attr("subject", "A"),
            Node::new("group")
                .with_attr("id", "2-2")
                .with_attr("subject", "B")
                .with_children(vec![Node::new("participant").with_attr("jid", "111@s.whatsapp.net")]),
        ])]);
        let groups = parse_joined_groups(&resp).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].jid, "1-1@g.us".parse::<Jid>().unwrap());
        assert_eq!(groups[1].name, "B");
        assert_eq!(groups[1].participants.len(), 1);

        let nameless = Node::new("iq").with_children(vec![Node::new("groups")
            .with_children(vec![Node::new("group").with_attr("subject", "no id")])]);
        assert!(parse_joined_groups(&nameless).is_err());
    }

    #[test]
    fn chat_presence_shape() {
        let own: Jid = "111:3@s.whatsapp.net".parse().unwrap();
        let to = Jid::user("222");
        let node = chat_presence_node(&own, &to, ChatPresence::Composing, ChatPresenceMedia::Audio);
        assert_eq!(node.tag, "chatstate");
        assert_eq!(node.attr("from"), Some("111@s.whatsapp.net"));
        assert_eq!(node.attr("to"), Some("222@s.whatsapp.net"));
        assert_eq!(node.get_child_by_tag("composing").unwrap().attr("media"), Some("audio"));

        let paused = chat_presence_node(&own, &to, ChatPresence::Paused, ChatPresenceMedia::Audio);
        assert!(paused.get_child_by_tag("paused").unwrap().attr("media").is_none());
    }
}
