// ── System template auto-binding ──

use tracing::info;

use super::Engine;
use crate::model::{DciCleanup, EventCode, Node, NodeFlags, SYSTEM_AGENT_TEMPLATE, SYSTEM_SNMP_TEMPLATE};

/// Templates a node belongs to exactly while it has the paired flag.
const SYSTEM_TEMPLATES: [(&str, NodeFlags); 2] = [
    (SYSTEM_AGENT_TEMPLATE, NodeFlags::IS_NATIVE_AGENT),
    (SYSTEM_SNMP_TEMPLATE, NodeFlags::IS_SNMP),
];

/// Bind or unbind the system templates to match the node's flags.
///
/// Every unbinding queues a cleanup of the collection items the
/// template left on the node. Returns `true` if membership changed.
pub(crate) fn apply_system_templates(engine: &Engine, node: &Node) -> bool {
    let node_id = node.id();
    let flags = node.flags();
    let mut changed = false;

    for (name, flag) in SYSTEM_TEMPLATES {
        let template = engine.registry.system_template(name);
        let wanted = flags.contains(flag);
        let bound = node.read(|d| d.templates.contains(&template.id));

        if wanted && !bound {
            template.bind(node_id);
            node.update(|d| d.templates.insert(template.id));
            info!(node_id, template = name, "applying system template");
            engine.post(
                engine
                    .event(EventCode::TemplateAutoapply, node_id)
                    .arg("templateId", template.id)
                    .arg("templateName", name),
            );
            changed = true;
        } else if !wanted && bound {
            template.unbind(node_id);
            node.update(|d| d.templates.remove(&template.id));
            engine.registry.queue_dci_cleanup(DciCleanup {
                template_id: template.id,
                node_id,
            });
            info!(node_id, template = name, "removing system template");
            engine.post(
                engine
                    .event(EventCode::TemplateAutoremove, node_id)
                    .arg("templateId", template.id)
                    .arg("templateName", name),
            );
            changed = true;
        }
    }
    changed
}
