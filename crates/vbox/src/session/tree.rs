//! File tree construction from flat object keys.

use vbox_protocol::FileNode;

/// `projects/<projectId>`
pub fn project_root(project_id: &str) -> String {
    format!("projects/{project_id}")
}

/// Relative path of `id` below the project root, if it belongs to the project.
pub fn relative_path<'a>(project_id: &str, id: &'a str) -> Option<&'a str> {
    let rest = id.strip_prefix("projects/")?;
    let rest = rest.strip_prefix(project_id)?;
    let rest = rest.strip_prefix('/')?;
    (!rest.is_empty()).then_some(rest)
}

/// A relative path is usable as an object key suffix: no empty, `.` or `..`
/// segments and no leading slash.
pub fn is_valid_relative(path: &str) -> bool {
    !path.is_empty()
        && path
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

/// Last segment of an id.
pub fn base_name(id: &str) -> &str {
    id.rsplit_once('/').map(|(_, name)| name).unwrap_or(id)
}

/// Everything before the last segment of an id.
pub fn parent_id(id: &str) -> &str {
    id.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Replace `old` with `new` when `id` is `old` itself or lies below it.
pub fn replace_prefix(id: &str, old: &str, new: &str) -> Option<String> {
    if id == old {
        return Some(new.to_string());
    }
    id.strip_prefix(old)
        .filter(|rest| rest.starts_with('/'))
        .map(|rest| format!("{new}{rest}"))
}

fn insert_folder<'a>(level: &'a mut Vec<FileNode>, id: &str, name: &str) -> &'a mut Vec<FileNode> {
    let index = match level
        .iter()
        .position(|node| node.is_folder() && node.name() == name)
    {
        Some(index) => index,
        None => {
            level.push(FileNode::Folder {
                id: id.to_string(),
                name: name.to_string(),
                children: Vec::new(),
            });
            level.len() - 1
        }
    };
    match &mut level[index] {
        FileNode::Folder { children, .. } => children,
        // position() only matches folders and push() adds one.
        FileNode::File { .. } => unreachable!("folder index points at a file"),
    }
}

fn insert_path(forest: &mut Vec<FileNode>, project_id: &str, relative: &str, is_file: bool) {
    let parts: Vec<&str> = relative.split('/').collect();
    let mut level = forest;
    let mut id = project_root(project_id);
    for (i, part) in parts.iter().enumerate() {
        id.push('/');
        id.push_str(part);
        let last = i + 1 == parts.len();
        if last && is_file {
            if !level.iter().any(|node| node.id() == id) {
                level.push(FileNode::File {
                    id: id.clone(),
                    name: part.to_string(),
                });
            }
        } else {
            level = insert_folder(level, &id, part);
        }
    }
}

/// Build the ordered forest for a project.
///
/// Files keep the order given; explicit (possibly empty) folders are merged
/// afterwards. Ids outside the project are ignored.
pub fn build_tree<'a, F, D>(project_id: &str, files: F, folders: D) -> Vec<FileNode>
where
    F: IntoIterator<Item = &'a str>,
    D: IntoIterator<Item = &'a str>,
{
    let mut forest = Vec::new();
    for id in files {
        if let Some(rel) = relative_path(project_id, id) {
            insert_path(&mut forest, project_id, rel, true);
        }
    }
    for id in folders {
        if let Some(rel) = relative_path(project_id, id) {
            insert_path(&mut forest, project_id, rel, false);
        }
    }
    forest
}
