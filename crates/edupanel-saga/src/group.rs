//! Group view: records sharing a logical name, folded for display.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use edupanel_core::Record;

/// One record of a group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMember {
    pub parent_id: Option<Uuid>,
    pub record_id: Uuid,
    pub record: Record,
}

/// Records sharing a name. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    pub name: String,
    pub members: Vec<GroupMember>,
}

impl Group {
    pub fn parent_ids(&self) -> Vec<Option<Uuid>> {
        self.members.iter().map(|m| m.parent_id).collect()
    }

    pub fn record_ids(&self) -> Vec<Uuid> {
        self.members.iter().map(|m| m.record_id).collect()
    }
}

/// A page of groups.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupPage {
    pub groups: Vec<Group>,
    /// Number of groups before paging.
    pub total: usize,
}

/// Group records by name, keeping first-seen order of groups and members.
pub fn group_by_name(records: impl IntoIterator<Item = Record>) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        let member = GroupMember {
            parent_id: record.parent_id,
            record_id: record.id,
            record,
        };
        match index.get(&member.record.name) {
            Some(&idx) => groups[idx].members.push(member),
            None => {
                index.insert(member.record.name.clone(), groups.len());
                groups.push(Group {
                    name: member.record.name.clone(),
                    members: vec![member],
                });
            }
        }
    }
    groups
}

/// Page over groups rather than records.
pub fn paginate_groups(groups: Vec<Group>, limit: usize, offset: usize) -> GroupPage {
    let total = groups.len();
    GroupPage {
        groups: groups.into_iter().skip(offset).take(limit).collect(),
        total,
    }
}
