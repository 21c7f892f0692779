//! Static schemas of the destination tables.
//!
//! Every extracted file is matched to one [`TableSpec`] by a marker in its
//! name (`...EMPRECSV`, `...ESTABELE`, ...). Schemas are positional: source
//! files have no header row.

use crate::manifest::DatasetGroup;

/// Typed representation of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    /// Whole number; dates are published as `YYYYMMDD` integers.
    Integer,
    /// Number with `,` as decimal separator (`capital_social`).
    Decimal,
}

impl ColumnType {
    /// SQLite column type affinity.
    #[must_use]
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Decimal => "REAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnType,
}

const fn text(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        kind: ColumnType::Text,
    }
}

const fn int(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        kind: ColumnType::Integer,
    }
}

const fn decimal(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        kind: ColumnType::Decimal,
    }
}

/// Character encoding of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEncoding {
    /// ISO-8859-1; every byte maps to one code point.
    Latin1,
    Utf8,
}

/// Destination table schema and the files that feed it.
#[derive(Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    /// Upper-case token identifying extracted files of this table.
    pub marker: &'static str,
    pub group: DatasetGroup,
    pub columns: &'static [ColumnSpec],
    pub encoding: SourceEncoding,
    /// Join key indexed after load.
    pub index_column: Option<&'static str>,
}

impl TableSpec {
    /// Column names in file order.
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }
}

const EMPRESA: &[ColumnSpec] = &[
    text("cnpj_basico"),
    text("razao_social"),
    int("natureza_juridica"),
    int("qualificacao_responsavel"),
    decimal("capital_social"),
    int("porte_empresa"),
    text("ente_federativo_responsavel"),
];

const ESTABELECIMENTO: &[ColumnSpec] = &[
    text("cnpj_basico"),
    text("cnpj_ordem"),
    text("cnpj_dv"),
    int("identificador_matriz_filial"),
    text("nome_fantasia"),
    int("situacao_cadastral"),
    int("data_situacao_cadastral"),
    int("motivo_situacao_cadastral"),
    text("nome_cidade_exterior"),
    text("pais"),
    int("data_inicio_atividade"),
    int("cnae_fiscal_principal"),
    text("cnae_fiscal_secundaria"),
    text("tipo_logradouro"),
    text("logradouro"),
    text("numero"),
    text("complemento"),
    text("bairro"),
    text("cep"),
    text("uf"),
    int("municipio"),
    text("ddd_1"),
    text("telefone_1"),
    text("ddd_2"),
    text("telefone_2"),
    text("ddd_fax"),
    text("fax"),
    text("correio_eletronico"),
    text("situacao_especial"),
    int("data_situacao_especial"),
];

const SOCIOS: &[ColumnSpec] = &[
    text("cnpj_basico"),
    int("identificador_socio"),
    text("nome_socio_razao_social"),
    text("cpf_cnpj_socio"),
    int("qualificacao_socio"),
    int("data_entrada_sociedade"),
    int("pais"),
    text("representante_legal"),
    text("nome_do_representante"),
    int("qualificacao_representante_legal"),
    int("faixa_etaria"),
];

const SIMPLES: &[ColumnSpec] = &[
    text("cnpj_basico"),
    text("opcao_pelo_simples"),
    int("data_opcao_simples"),
    int("data_exclusao_simples"),
    text("opcao_mei"),
    int("data_opcao_mei"),
    int("data_exclusao_mei"),
];

const TEXT_LOOKUP: &[ColumnSpec] = &[text("codigo"), text("descricao")];

const CODE_LOOKUP: &[ColumnSpec] = &[int("codigo"), text("descricao")];

const fn spec(
    name: &'static str,
    marker: &'static str,
    group: DatasetGroup,
    columns: &'static [ColumnSpec],
    index_column: Option<&'static str>,
) -> TableSpec {
    TableSpec {
        name,
        marker,
        group,
        columns,
        encoding: SourceEncoding::Latin1,
        index_column,
    }
}

/// All destination tables, in load order.
pub static TABLES: [TableSpec; 10] = [
    spec("empresa", "EMPRE", DatasetGroup::Empresas, EMPRESA, Some("cnpj_basico")),
    spec(
        "estabelecimento",
        "ESTABELE",
        DatasetGroup::Estabelecimentos,
        ESTABELECIMENTO,
        Some("cnpj_basico"),
    ),
    spec("socios", "SOCIO", DatasetGroup::Socios, SOCIOS, Some("cnpj_basico")),
    spec("simples", "SIMPLES", DatasetGroup::Simples, SIMPLES, Some("cnpj_basico")),
    spec("cnae", "CNAE", DatasetGroup::Cnaes, TEXT_LOOKUP, None),
    spec("moti", "MOTI", DatasetGroup::Motivos, CODE_LOOKUP, None),
    spec("munic", "MUNIC", DatasetGroup::Municipios, CODE_LOOKUP, None),
    spec("natju", "NATJU", DatasetGroup::Naturezas, CODE_LOOKUP, None),
    spec("pais", "PAIS", DatasetGroup::Paises, CODE_LOOKUP, None),
    spec("quals", "QUALS", DatasetGroup::Qualificacoes, CODE_LOOKUP, None),
];

/// Looks up a table by name.
#[must_use]
pub fn table_spec(name: &str) -> Option<&'static TableSpec> {
    TABLES.iter().find(|t| t.name == name)
}

/// Finds the table an extracted file belongs to, by marker in its name.
#[must_use]
pub fn classify_entry(file_name: &str) -> Option<&'static TableSpec> {
    let upper = file_name.to_ascii_uppercase();
    TABLES.iter().find(|t| upper.contains(t.marker))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_real_entry_names() {
        let cases = [
            ("K3241.K03200Y0.D50809.EMPRECSV", "empresa"),
            ("K3241.K03200Y3.D50809.ESTABELE", "estabelecimento"),
            ("K3241.K03200Y9.D50809.SOCIOCSV", "socios"),
            ("F.K03200$W.SIMPLES.CSV.D50809", "simples"),
            ("F.K03200$Z.D50809.CNAECSV", "cnae"),
            ("F.K03200$Z.D50809.MOTICSV", "moti"),
            ("F.K03200$Z.D50809.MUNICCSV", "munic"),
            ("F.K03200$Z.D50809.NATJUCSV", "natju"),
            ("F.K03200$Z.D50809.PAISCSV", "pais"),
            ("F.K03200$Z.D50809.QUALSCSV", "quals"),
        ];
        for (file, table) in cases {
            assert_eq!(classify_entry(file).unwrap().name, table, "{file}");
        }
        assert!(classify_entry("LEIAME.txt").is_none());
    }

    #[test]
    fn test_schemas_have_expected_widths() {
        assert_eq!(table_spec("empresa").unwrap().columns.len(), 7);
        assert_eq!(table_spec("estabelecimento").unwrap().columns.len(), 30);
        assert_eq!(table_spec("socios").unwrap().columns.len(), 11);
        assert_eq!(table_spec("simples").unwrap().columns.len(), 7);
        assert!(TABLES[4..].iter().all(|t| t.columns.len() == 2));
    }

    #[test]
    fn test_principal_tables_are_indexed_on_cnpj_basico() {
        let indexed: Vec<_> = TABLES
            .iter()
            .filter(|t| t.index_column == Some("cnpj_basico"))
            .map(|t| t.name)
            .collect();
        assert_eq!(indexed, ["empresa", "estabelecimento", "socios", "simples"]);
    }

    #[test]
    fn test_capital_social_is_decimal() {
        let empresa = table_spec("empresa").unwrap();
        assert_eq!(empresa.columns[4].kind, ColumnType::Decimal);
        assert_eq!(empresa.encoding, SourceEncoding::Latin1);
    }
}
