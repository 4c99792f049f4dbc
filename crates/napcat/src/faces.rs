//! QQ built-in face ids mapped to the closest Unicode emoji.

#[rustfmt::skip]
const FACES: &[(&str, &str)] = &[
    ("0", "😲"), ("1", "😖"), ("2", "😍"), ("3", "😶"), ("4", "😎"),
    ("5", "😭"), ("6", "☺️"), ("7", "🤐"), ("8", "😴"), ("9", "😢"),
    ("10", "😤"), ("11", "😊"), ("12", "😜"), ("13", "😁"), ("14", "🙂"),
    ("15", "😡"), ("16", "🤗"), ("18", "😱"), ("19", "🤮"), ("20", "🤭"),
    ("21", "😊"), ("22", "😌"), ("23", "😕"), ("24", "🤤"), ("25", "😂"),
    ("26", "😅"), ("27", "😒"), ("28", "😘"), ("29", "😚"), ("30", "🔪"),
    ("31", "🍺"), ("32", "😩"), ("33", "😓"), ("34", "😀"), ("35", "🥺"),
    ("46", "🐷"), ("49", "🤡"), ("53", "🎂"), ("54", "⚡"), ("55", "💣"),
    ("56", "🔪"), ("57", "⚽"), ("59", "💩"), ("60", "☕"), ("63", "🌹"),
    ("64", "🥀"), ("66", "❤️"), ("67", "💔"), ("69", "🎁"), ("74", "🌞"),
    ("75", "🌙"), ("76", "👍"), ("77", "👎"), ("78", "🤝"), ("79", "✌️"),
    ("85", "😷"), ("86", "😣"), ("96", "😰"), ("97", "😥"), ("98", "😨"),
    ("99", "😫"), ("100", "😤"), ("101", "😈"), ("102", "💀"), ("103", "🏁"),
    ("104", "🏀"), ("105", "🏓"), ("106", "❤️"), ("107", "🐛"), ("108", "🐔"),
    ("109", "🐶"), ("110", "👏"), ("111", "💪"), ("112", "🤞"), ("113", "🖕"),
    ("114", "💃"), ("115", "🤦"), ("116", "🙇"), ("117", "🤷"), ("118", "💆"),
    ("120", "✊"), ("121", "🤟"), ("122", "🤘"), ("123", "🤙"), ("124", "👌"),
    ("125", "👈"), ("126", "👉"), ("127", "👆"), ("128", "👇"), ("129", "🙏"),
    ("144", "🍉"), ("147", "🍭"), ("171", "🍵"), ("172", "😿"), ("173", "🐱"),
    ("174", "🐻"), ("176", "🐲"), ("177", "🎉"), ("178", "🎊"), ("179", "🎈"),
    ("182", "💊"), ("183", "🔫"), ("200", "🐑"), ("201", "🎄"), ("202", "🎎"),
    ("203", "💝"), ("204", "🏠"), ("212", "😄"), ("214", "🤩"),
    ("277", "🐕"), ("307", "🌈"), ("312", "🤳"), ("318", "💅"), ("319", "🤠"),
    ("320", "😇"), ("322", "😴"), ("325", "🤮"),
];

/// Emoji for a face id, if the id is in the table.
pub fn face_emoji(id: &str) -> Option<&'static str> {
    let id = id.trim();
    FACES.iter().find(|(k, _)| *k == id).map(|(_, v)| *v)
}

/// First face id rendered as `glyph`. Used to react with an emoji.
pub fn face_id_for_emoji(glyph: &str) -> Option<&'static str> {
    let glyph = glyph.trim();
    FACES.iter().find(|(_, v)| *v == glyph).map(|(k, _)| *k)
}
