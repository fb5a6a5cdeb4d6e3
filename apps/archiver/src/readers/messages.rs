//! Message records. One row per message with its channel, contact, labels
//! and attachments embedded. For anonymous orgs the URN path is masked and
//! the contact name suppressed. `response_to` is appended only for replies;
//! other records carry no such key.
//!
//! Attachments are stored as `content_type:url` strings; the non-greedy
//! match splits on the first colon so URLs keep theirs.

pub const LOOKUP_MESSAGES: &str = r#"
SELECT rec.created_on,
       CASE WHEN mm.response_to_id IS NULL
            THEN row_to_json(rec)::text
            ELSE left(row_to_json(rec)::text, -1) || ',"response_to":' || mm.response_to_id || '}'
       END
FROM msgs_msg mm
JOIN contacts_contact cc ON mm.contact_id = cc.id
LEFT JOIN contacts_contacturn ccu ON mm.contact_urn_id = ccu.id
LEFT JOIN channels_channel ch ON mm.channel_id = ch.id
CROSS JOIN LATERAL (
  SELECT
    mm.id,
    mm.broadcast_id AS broadcast,
    CASE WHEN $2
      THEN json_build_object('uuid', cc.uuid)
      ELSE json_build_object('uuid', cc.uuid, 'name', cc.name)
    END AS contact,
    CASE WHEN $2
      THEN ccu.scheme || ':********'
      ELSE ccu.identity
    END AS urn,
    json_build_object('uuid', ch.uuid, 'name', ch.name) AS channel,
    CASE WHEN mm.direction = 'I' THEN 'in'
         WHEN mm.direction = 'O' THEN 'out'
         ELSE NULL
    END AS direction,
    CASE WHEN mm.msg_type = 'F' THEN 'flow'
         WHEN mm.msg_type = 'V' THEN 'ivr'
         ELSE 'inbox'
    END AS type,
    CASE WHEN mm.status = 'I' THEN 'initializing'
         WHEN mm.status = 'P' THEN 'queued'
         WHEN mm.status = 'Q' THEN 'queued'
         WHEN mm.status = 'W' THEN 'wired'
         WHEN mm.status = 'S' THEN 'sent'
         WHEN mm.status = 'D' THEN 'delivered'
         WHEN mm.status = 'H' THEN 'handled'
         WHEN mm.status = 'E' THEN 'errored'
         WHEN mm.status = 'F' THEN 'failed'
         WHEN mm.status = 'R' THEN 'resent'
         ELSE NULL
    END AS status,
    CASE WHEN mm.visibility = 'V' THEN 'visible'
         WHEN mm.visibility = 'A' THEN 'archived'
         WHEN mm.visibility = 'D' THEN 'deleted'
         ELSE NULL
    END AS visibility,
    mm.text,
    (SELECT coalesce(jsonb_agg(attach_row), '[]'::jsonb)
     FROM (
       SELECT attach_data.attachment[1] AS content_type, attach_data.attachment[2] AS url
       FROM (SELECT regexp_matches(unnest(mm.attachments), '^(.*?):(.*)$') AS attachment) attach_data
     ) attach_row) AS attachments,
    (SELECT coalesce(jsonb_agg(label_row), '[]'::jsonb)
     FROM (
       SELECT ml.uuid, ml.name
       FROM msgs_msg_labels mml
       JOIN msgs_label ml ON mml.label_id = ml.id
       WHERE mml.msg_id = mm.id
     ) label_row) AS labels,
    mm.created_on,
    mm.modified_on,
    mm.sent_on
) rec
WHERE mm.org_id = $1 AND mm.created_on >= $3 AND mm.created_on < $4
ORDER BY mm.created_on ASC, mm.id ASC
"#;
